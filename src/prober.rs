use std::time::Duration;

use regex::Regex;

use crate::constants::EMOJI_X;
use crate::core::AppState;
use crate::types::Result;

/// An optional descriptor carrying a commit title and SHA that plausibly
/// caused a mergeability change, used to craft a more specific comment
/// when the prober detects a PR has gone from mergeable to not.
#[derive(Debug, Clone)]
pub struct MergeabilityCause {
	pub title: String,
	pub sha: String,
}

impl MergeabilityCause {
	/// The PR number extracted from a merge-commit-shaped title
	/// (`Merge pull request #42 from ...`, `Auto merge of #42 - ...`), if
	/// any; otherwise the short form of the cause's SHA is used instead.
	fn attribution(&self) -> String {
		let re = Regex::new(r"[Mm]erge (?:of|pull request) #(\d+)").expect("static regex");
		match re.captures(&self.title) {
			Some(caps) => format!("#{}", &caps[1]),
			None => self.sha[..self.sha.len().min(7)].to_string(),
		}
	}
}

/// GitHub computes a pull request's `mergeable` field asynchronously;
/// right after a PR is opened or its head moves, the field reads `null`
/// and has to be polled until it settles. Mirrors `fetch_mergeability` in
/// the original: one retry five seconds later before giving up. If the
/// PR's previously known value was mergeable and the fresh read says it
/// isn't, a comment is posted noting the conflict and, when a cause is
/// given, attributing it to the commit that plausibly caused the change.
pub async fn fetch_mergeability(
	state: &AppState,
	owner: &str,
	repo: &str,
	number: i64,
	previous: Option<bool>,
	cause: Option<&MergeabilityCause>,
) -> Result<Option<bool>> {
	for attempt in 0..2 {
		let pr = state.gh_client.get_pull_request(owner, repo, number).await?;
		if let Some(mergeable) = pr.mergeable {
			if previous == Some(true) && !mergeable {
				let attribution = cause.map(|c| c.attribution()).unwrap_or_else(|| format!("#{}", number));
				state
					.gh_client
					.create_issue_comment(
						owner,
						repo,
						number,
						&format!(
							"{} This pull request is no longer mergeable (presumably {}). Please resolve the conflicts.",
							EMOJI_X, attribution
						),
					)
					.await
					.ok();
			}
			// Bypasses the probe queue: this write must not re-trigger
			// another mergeability check.
			state.store.set_mergeable(owner, repo, number, Some(mergeable)).await?;
			return Ok(Some(mergeable));
		}
		if attempt == 0 {
			tokio::time::sleep(Duration::from_secs(5)).await;
		}
	}

	log::warn!(
		"{}/{}#{}: mergeability still unknown after retries",
		owner,
		repo,
		number
	);
	Ok(previous)
}

/// Background task that, once per tick, probes mergeability for every PR
/// still showing `mergeable = NULL` across all configured repositories.
pub async fn run_prober(state: &AppState, tick: Duration) -> ! {
	let mut interval = tokio::time::interval(tick);
	loop {
		interval.tick().await;
		for repo_cfg in &state.config.repos {
			let entities = match state.store.list_repo(&repo_cfg.owner, &repo_cfg.repo).await {
				Ok(entities) => entities,
				Err(err) => {
					log::error!("prober: failed to list {}/{}: {}", repo_cfg.owner, repo_cfg.repo, err);
					continue;
				}
			};
			for entity in entities.into_iter().filter(|e| e.mergeable.is_none()) {
				if let Err(err) =
					fetch_mergeability(state, &repo_cfg.owner, &repo_cfg.repo, entity.number, entity.mergeable, None)
						.await
				{
					log::error!("prober: {}: {}", entity.repo_label(), err);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn attribution_prefers_pr_number_from_merge_commit_title() {
		let cause = MergeabilityCause {
			title: "Merge pull request #42 from someone/branch".to_string(),
			sha: "abcdef0123456789".to_string(),
		};
		assert_eq!(cause.attribution(), "#42");
	}

	#[test]
	fn attribution_falls_back_to_short_sha() {
		let cause = MergeabilityCause {
			title: "Fix a typo".to_string(),
			sha: "abcdef0123456789".to_string(),
		};
		assert_eq!(cause.attribution(), "abcdef0");
	}
}
