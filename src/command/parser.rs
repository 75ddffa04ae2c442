use super::{Directive, ParsedComment};
use regex::Regex;

fn sha_re() -> Regex {
	Regex::new(r"^[0-9a-f]{4,40}$").expect("static regex")
}

/// Prefix comparison used to validate an `r+ <sha>` argument against a
/// PR's current head: `short` must be at least 4 hex characters and a
/// literal prefix of `full`. Exposed so callers applying directives can
/// decide whether a pinned-SHA approval actually matches.
pub fn sha_cmp(short: &str, full: &str) -> bool {
	short.len() >= 4 && sha_re().is_match(short) && full.starts_with(short)
}

/// True for a token that is itself one of the recognized directives,
/// so the `r+`/`r=` sha-argument lookahead doesn't swallow a following
/// command (`r+ p=10` must still parse `p=10` as a priority directive,
/// not as a rejected sha).
fn is_directive_token(word: &str) -> bool {
	word == "r+"
		|| word == "r-"
		|| word.starts_with("r+=")
		|| word.starts_with("r=")
		|| word.starts_with("p=")
		|| word == "retry"
		|| word == "try"
		|| word == "try-"
		|| word == "rollup"
		|| word == "rollup-"
		|| word == "force"
		|| word == "clean"
}

/// Tokenizes and interprets comments addressed to the bot. Scans tokens
/// **right to left**: when a directive like `r+` needs a trailing argument
/// (a pinned SHA), that argument sits one token to its right in the
/// comment text, which — because the scan runs backwards — has already
/// been visited by the time the directive token itself is reached. This
/// lets the parser consume it as the directive's argument instead of
/// re-interpreting it as a stray word, exactly as the original
/// right-to-left comment scanner does.
pub struct CommandParser {
	bot_mention: String,
}

impl CommandParser {
	pub fn new(bot_username: &str) -> Self {
		Self {
			bot_mention: format!("@{}", bot_username),
		}
	}

	pub fn parse(&self, body: &str) -> ParsedComment {
		let mut out = ParsedComment::default();

		let words: Vec<&str> = body
			.lines()
			.filter(|line| line.contains(&self.bot_mention))
			.flat_map(|line| line.split_whitespace())
			.collect();

		if words.is_empty() {
			return out;
		}
		out.mentioned = true;

		let mut consumed = vec![false; words.len()];

		for i in (0..words.len()).rev() {
			if consumed[i] {
				continue;
			}
			let word = words[i];

			// Captures the following token as a candidate sha even if it
			// turns out not to be valid hex: the caller still needs the
			// raw text to report back a clarifying comment. A token that
			// is itself a recognized directive is left alone so e.g.
			// `r+ p=10` parses both `r+` and `p=10` independently.
			let next_sha = |consumed: &mut Vec<bool>| -> Option<String> {
				if i + 1 < words.len() && !consumed[i + 1] && !is_directive_token(words[i + 1]) {
					consumed[i + 1] = true;
					Some(words[i + 1].to_string())
				} else {
					None
				}
			};

			if word == "r+" {
				let sha = next_sha(&mut consumed);
				out.directives.push(Directive::Approve { sha });
			} else if let Some(rest) = word.strip_prefix("r+=") {
				out.directives.push(Directive::Approve {
					sha: Some(rest.to_string()),
				});
			} else if let Some(rest) = word.strip_prefix("r=") {
				let (approvers_part, sha) = match rest.split_once('=') {
					Some((a, s)) => (a, Some(s.to_string())),
					None => (rest, None),
				};
				let approvers = approvers_part
					.split(',')
					.map(|s| s.to_string())
					.filter(|s| !s.is_empty())
					.collect();
				out.directives
					.push(Directive::ApproveFor { approvers, sha });
			} else if word == "r-" {
				out.directives.push(Directive::Unapprove);
			} else if let Some(rest) = word.strip_prefix("p=") {
				if let Ok(n) = rest.parse::<i32>() {
					out.directives.push(Directive::SetPriority(n));
				}
			} else if word == "retry" {
				out.directives.push(Directive::Retry);
			} else if word == "try-" {
				out.directives.push(Directive::TryCancel);
			} else if word == "try" {
				out.directives.push(Directive::Try);
			} else if word == "rollup-" {
				out.directives.push(Directive::RollupCancel);
			} else if word == "rollup" {
				out.directives.push(Directive::Rollup);
			} else if word == "force" {
				out.directives.push(Directive::Force);
			} else if word == "clean" {
				out.directives.push(Directive::Clean);
			}
		}

		// The scan ran back to front; restore the order a reader would
		// encounter the directives in the original comment.
		out.directives.reverse();
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parser() -> CommandParser {
		CommandParser::new("bot")
	}

	#[test]
	fn plain_approve() {
		let parsed = parser().parse("@bot r+");
		assert_eq!(parsed.directives, vec![Directive::Approve { sha: None }]);
	}

	#[test]
	fn approve_pinned_to_sha_as_trailing_token() {
		let parsed = parser().parse("@bot r+ 1234567");
		assert_eq!(
			parsed.directives,
			vec![Directive::Approve {
				sha: Some("1234567".to_string())
			}]
		);
	}

	#[test]
	fn approve_pinned_to_sha_inline() {
		let parsed = parser().parse("@bot r+=abcdef0");
		assert_eq!(
			parsed.directives,
			vec![Directive::Approve {
				sha: Some("abcdef0".to_string())
			}]
		);
	}

	#[test]
	fn priority_and_rollup_combine() {
		let parsed = parser().parse("@bot r+ p=10 rollup");
		assert_eq!(
			parsed.directives,
			vec![
				Directive::Approve { sha: None },
				Directive::SetPriority(10),
				Directive::Rollup,
			]
		);
	}

	#[test]
	fn unrelated_comment_is_not_mentioned() {
		let parsed = parser().parse("looks good to me");
		assert!(!parsed.mentioned);
		assert!(parsed.directives.is_empty());
	}

	#[test]
	fn approve_with_non_hex_token_still_captures_it_for_validation() {
		let parsed = parser().parse("@bot r+ deadXXXX");
		assert_eq!(
			parsed.directives,
			vec![Directive::Approve {
				sha: Some("deadXXXX".to_string())
			}]
		);
		assert!(!sha_cmp("deadXXXX", "deadbeefcafebabe"));
	}

	#[test]
	fn sha_cmp_requires_four_char_prefix() {
		assert!(sha_cmp("dead", "deadbeef"));
		assert!(!sha_cmp("de", "deadbeef"));
		assert!(!sha_cmp("deadbeef", "deadbee0"));
	}

	#[test]
	fn approve_for_named_reviewers() {
		let parsed = parser().parse("@bot r=alice,bob");
		assert_eq!(
			parsed.directives,
			vec![Directive::ApproveFor {
				approvers: vec!["alice".to_string(), "bob".to_string()],
				sha: None,
			}]
		);
	}
}
