mod parser;

pub use parser::{sha_cmp, CommandParser};

use crate::constants::{EMOJI_PUSHPIN, EMOJI_QUESTION};
use crate::entity::{Approval, PullRequest, Status};

/// A single directive extracted from a comment mentioning the bot. One
/// comment can carry several directives (`@bot r+ p=10`); each is applied
/// independently to the target entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
	/// `r+[=sha]` — approve, optionally pinned to a specific SHA.
	Approve { sha: Option<String> },
	/// `r=user[,user...][=sha]` — approve on behalf of named reviewers.
	ApproveFor { approvers: Vec<String>, sha: Option<String> },
	/// `r-` — withdraw approval.
	Unapprove,
	/// `p=N` — set priority.
	SetPriority(i32),
	/// `retry` — re-run the last build.
	Retry,
	/// `try` — request a try build without merging.
	Try,
	/// `try-` — cancel a pending try build.
	TryCancel,
	/// `rollup` — mark eligible for rollup batching.
	Rollup,
	/// `rollup-` — unmark rollup eligibility.
	RollupCancel,
	/// `force` — stop the currently running selected builders.
	Force,
	/// `clean` — discard the current build state.
	Clean,
}

/// Outcome of parsing a single comment body: the directives found, in the
/// order a reader would encounter them, and whether the bot's name was
/// even mentioned (used by callers to decide whether to bother at all).
#[derive(Debug, Default)]
pub struct ParsedComment {
	pub directives: Vec<Directive>,
	pub mentioned: bool,
}

/// A side effect a directive's application wants carried out once the
/// caller has a chance to talk to the hosting platform or CI. Kept
/// separate from the pure entity mutation so `apply` stays a plain
/// function over `&mut PullRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
	/// Post a comment back to the PR.
	Comment(String),
	/// Stop the currently running selected builders for this repo
	/// (`force`); only meaningful for session CI.
	StopSelectedBuilders,
}

/// Applies one parsed directive to `entity`, returning any side effects
/// the caller should carry out (a comment to post, a CI action to take).
/// `realtime` distinguishes live webhook processing from the
/// synchronizer's historical replay: per the directive table, `retry`,
/// `try`/`try-`, `force` and `clean` only take effect live, and a
/// mismatched pinned-sha approval only gets a clarifying comment live.
pub fn apply(entity: &mut PullRequest, directive: Directive, author: &str, realtime: bool) -> Vec<Effect> {
	match directive {
		Directive::Approve { sha } => approve(entity, author.to_string(), sha, realtime),
		Directive::ApproveFor { approvers, sha } => match approvers.into_iter().next() {
			Some(approver) => approve(entity, approver, sha, realtime),
			None => vec![],
		},
		Directive::Unapprove => {
			entity.approval = None;
			vec![]
		}
		Directive::SetPriority(p) => {
			entity.priority = p;
			vec![]
		}
		Directive::Retry if realtime => {
			entity.status = Status::Empty;
			vec![]
		}
		Directive::Try if realtime => {
			entity.try_ = true;
			entity.merge_sha = None;
			entity.build_res.clear();
			vec![]
		}
		Directive::TryCancel if realtime => {
			entity.try_ = false;
			entity.status = Status::Empty;
			entity.merge_sha = None;
			entity.build_res.clear();
			vec![]
		}
		Directive::Rollup => {
			entity.rollup = true;
			vec![]
		}
		Directive::RollupCancel => {
			entity.rollup = false;
			vec![]
		}
		Directive::Force if realtime => vec![Effect::StopSelectedBuilders],
		Directive::Clean if realtime => {
			entity.merge_sha = None;
			entity.build_res.clear();
			vec![]
		}
		// Non-realtime occurrence of a realtime-only directive: no-op,
		// per the directive table's "Requires realtime?" column.
		Directive::Retry | Directive::Try | Directive::TryCancel | Directive::Force | Directive::Clean => vec![],
	}
}

fn approve(entity: &mut PullRequest, approver: String, sha: Option<String>, realtime: bool) -> Vec<Effect> {
	match sha {
		None => {
			entity.approval = Some(Approval {
				approved_by: approver.clone(),
				approved_sha: entity.head_sha.clone(),
			});
			approval_ack(entity, &approver, realtime)
		}
		Some(candidate) => {
			if sha_cmp(&candidate, &entity.head_sha) {
				entity.approval = Some(Approval {
					approved_by: approver.clone(),
					approved_sha: entity.head_sha.clone(),
				});
				approval_ack(entity, &approver, realtime)
			} else if realtime {
				vec![Effect::Comment(format!(
					"{} `{}` is not a valid commit SHA. Please try again with `{}`.",
					EMOJI_QUESTION,
					candidate,
					&entity.head_sha[..entity.head_sha.len().min(7)],
				))]
			} else {
				vec![]
			}
		}
	}
}

/// The acknowledgement comment the original posts once an approval
/// actually lands, carrying the commit and approver so reviewers replaying
/// the thread can see what was approved at which SHA. Posted live only —
/// the synchronizer's historical replay shouldn't re-announce approvals
/// that already happened.
fn approval_ack(entity: &PullRequest, approver: &str, realtime: bool) -> Vec<Effect> {
	if !realtime {
		return vec![];
	}
	vec![Effect::Comment(format!(
		"{} Commit {} has been approved by `{}`.",
		EMOJI_PUSHPIN,
		&entity.head_sha[..entity.head_sha.len().min(7)],
		approver,
	))]
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pr() -> PullRequest {
		PullRequest::new("acme".into(), "widgets".into(), 1, "abc1234deadbeef".into())
	}

	#[test]
	fn realtime_approval_posts_a_pushpin_acknowledgement() {
		let mut entity = pr();
		let effects = apply(&mut entity, Directive::Approve { sha: None }, "alice", true);
		assert!(entity.is_approved());
		assert_eq!(effects.len(), 1);
		assert!(matches!(&effects[0], Effect::Comment(body) if body.contains(":pushpin:") && body.contains("alice")));
	}

	#[test]
	fn replayed_approval_during_sync_does_not_post_a_comment() {
		let mut entity = pr();
		let effects = apply(&mut entity, Directive::Approve { sha: None }, "alice", false);
		assert!(entity.is_approved());
		assert!(effects.is_empty());
	}

	#[test]
	fn mismatched_pinned_sha_leaves_approval_untouched() {
		let mut entity = pr();
		let effects = apply(&mut entity, Directive::Approve { sha: Some("ffffffff".into()) }, "alice", true);
		assert!(!entity.is_approved());
		assert_eq!(effects.len(), 1);
		assert!(matches!(&effects[0], Effect::Comment(body) if body.contains(":question:")));
	}

	#[test]
	fn unapprove_clears_approval() {
		let mut entity = pr();
		apply(&mut entity, Directive::Approve { sha: None }, "alice", true);
		apply(&mut entity, Directive::Unapprove, "alice", true);
		assert!(!entity.is_approved());
	}

	#[test]
	fn non_realtime_retry_is_a_noop() {
		let mut entity = pr();
		entity.status = Status::Error;
		apply(&mut entity, Directive::Retry, "alice", false);
		assert_eq!(entity.status, Status::Error);
	}

	#[test]
	fn realtime_retry_clears_status() {
		let mut entity = pr();
		entity.status = Status::Error;
		apply(&mut entity, Directive::Retry, "alice", true);
		assert_eq!(entity.status, Status::Empty);
	}
}
