use crate::command::{self, CommandParser};
use crate::config::RepoConfig;
use crate::constants::{STATUS_CONTEXT, SYNC_MAX_AGE_SECS};
use crate::core::AppState;
use crate::entity::{PullRequest, Status};
use crate::github::GithubCommitStatusState;
use crate::types::Result;

/// Rebuilds a repository's queue state from scratch by reading the
/// hosting platform directly, for use at startup (recovering from a crash
/// mid-build) and whenever the state is suspected to have drifted.
/// Mirrors `synchronize` in the original: purge the repository's rows,
/// list its open pull requests, then replay comments to recover approvals
/// and directives, ignoring PRs that haven't been touched in roughly two
/// months.
pub async fn synchronize_repo(state: &AppState, repo_cfg: &RepoConfig) -> Result<()> {
	state.store.purge_repo(&repo_cfg.owner, &repo_cfg.repo).await?;

	let open_prs = state
		.gh_client
		.list_open_pull_requests(&repo_cfg.owner, &repo_cfg.repo)
		.await?;

	let now = chrono::Utc::now();
	let parser = CommandParser::new(&state.config.bot_username);

	for pr in open_prs {
		let age = now.signed_duration_since(pr.updated_at).num_seconds();
		if age > SYNC_MAX_AGE_SECS {
			continue;
		}

		let mut entity = PullRequest::new(
			repo_cfg.owner.clone(),
			repo_cfg.repo.clone(),
			pr.number,
			pr.head.sha.clone(),
		);
		entity.title = pr.title.clone();
		entity.body = pr.body.clone().unwrap_or_default();
		entity.head_ref = format!("{}:{}", pr.head.repo.owner.login, pr.head.ref_field);
		entity.base_ref = pr.base.ref_field.clone();
		// Mergeability is always re-derived by the prober rather than
		// trusted from this one-shot read: the platform may not have
		// finished recomputing it, and a stale `true` could let an
		// actually-conflicting PR jump the queue until the next probe tick.
		entity.mergeable = None;

		// Stored rows are empty right after the purge above, so status
		// recovery degenerates to reading back the platform's own `homu`
		// status check against the current head.
		if let Ok(statuses) = state.gh_client.get_commit_statuses(&repo_cfg.owner, &repo_cfg.repo, &pr.head.sha).await {
			if let Some(check) = statuses.iter().find(|s| s.context == STATUS_CONTEXT) {
				entity.status = match check.state {
					GithubCommitStatusState::Success => Status::Success,
					GithubCommitStatusState::Pending => Status::Pending,
					GithubCommitStatusState::Failure => Status::Failure,
					GithubCommitStatusState::Error => Status::Error,
				};
			}
		}

		// Review comments bound to the current head replay first: they
		// carry a `sha` implicitly fixed to `original_commit_id`, the
		// commit the reviewer actually looked at.
		let review_comments = state
			.gh_client
			.list_review_comments(&repo_cfg.owner, &repo_cfg.repo, pr.number)
			.await?;
		for comment in review_comments {
			if comment.original_commit_id != pr.head.sha {
				continue;
			}
			if !is_authorized(repo_cfg, &state.config.bot_username, &comment.user.login) {
				continue;
			}
			let parsed = parser.parse(&comment.body);
			if !parsed.mentioned {
				continue;
			}
			for directive in parsed.directives {
				command::apply(&mut entity, directive, &comment.user.login, false);
			}
		}

		// Top-level issue comments replay next, with `sha` left unbound
		// (any pinned SHA in the comment itself is still honored by
		// `apply`'s own matching against the current head).
		let comments = state
			.gh_client
			.list_issue_comments(&repo_cfg.owner, &repo_cfg.repo, pr.number)
			.await?;
		for comment in comments {
			if !is_authorized(repo_cfg, &state.config.bot_username, &comment.user.login) {
				continue;
			}
			let parsed = parser.parse(&comment.body);
			if !parsed.mentioned {
				continue;
			}
			for directive in parsed.directives {
				command::apply(&mut entity, directive, &comment.user.login, false);
			}
		}

		state.store.upsert_pull(&entity).await?;
		log::debug!(
			"synchronized {}: status={:?} approved={}",
			entity.repo_label(),
			entity.status,
			entity.is_approved()
		);
	}

	match state.gh_client.rate_limit_status().await {
		Ok(status) => log::debug!("rate limit remaining after sync: {}", status.remaining),
		Err(err) => log::debug!("could not read rate limit after sync: {}", err),
	}

	Ok(())
}

fn is_authorized(repo_cfg: &RepoConfig, bot_username: &str, author: &str) -> bool {
	repo_cfg.reviewers.contains(&author.to_string()) || author == bot_username
}
