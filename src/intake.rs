use crate::command::{self, CommandParser, Effect};
use crate::config::CiKind;
use crate::core::AppState;
use crate::entity::{PullRequest, Status};
use crate::error::Error;
use crate::queue::process_queue;
use crate::types::Result;

/// A deserialized, already-authenticated hosting-platform event. The HTTP
/// transport (`webhook.rs`) is responsible for verifying the request and
/// producing one of these; everything from here on is pure core logic.
#[derive(Debug)]
pub enum InboundEvent {
	IssueComment {
		owner: String,
		repo: String,
		number: i64,
		author: String,
		body: String,
	},
	/// A comment left directly on a diff line rather than the PR's
	/// conversation tab. Directives in these are honored identically to an
	/// issue comment; the distinction only matters to the synchronizer's
	/// replay ordering (§4.6), which binds review comments to the commit
	/// they were posted against.
	ReviewComment {
		owner: String,
		repo: String,
		number: i64,
		author: String,
		body: String,
	},
	CommitStatus {
		owner: String,
		repo: String,
		commit_sha: String,
		context: String,
		succeeded: Option<bool>,
		url: Option<String>,
	},
	PullRequestOpened {
		owner: String,
		repo: String,
		number: i64,
		head_sha: String,
		head_ref: String,
		base_ref: String,
	},
	PullRequestUpdated {
		owner: String,
		repo: String,
		number: i64,
		head_sha: String,
	},
	PullRequestClosed {
		owner: String,
		repo: String,
		number: i64,
	},
}

/// Applies one inbound event to the entity store and, if it might have
/// changed what should build next, re-runs the queue processor for that
/// repository under the global lock.
pub async fn handle_event(state: &AppState, event: InboundEvent) -> Result<()> {
	match event {
		InboundEvent::IssueComment {
			owner,
			repo,
			number,
			author,
			body,
		}
		| InboundEvent::ReviewComment {
			owner,
			repo,
			number,
			author,
			body,
		} => handle_comment(state, owner, repo, number, author, body).await,
		InboundEvent::CommitStatus {
			owner,
			repo,
			commit_sha,
			context,
			succeeded,
			url,
		} => {
			let repo_cfg = state
				.config
				.repo(&owner, &repo)
				.ok_or_else(|| Error::NoCiConfigured {
					repo_label: format!("{}/{}", owner, repo),
				})?
				.clone();

			let builder = context
				.strip_prefix(crate::constants::STATUS_CONTEXT_PER_BUILDER_PREFIX)
				.unwrap_or(&context);

			let entities = state.store.list_repo(&owner, &repo).await?;
			if let Some(mut entity) = entities
				.into_iter()
				.find(|e| e.merge_sha.as_deref() == Some(commit_sha.as_str()))
			{
				if let Some(result) = entity.build_res.get_mut(builder) {
					if result.merge_sha.as_deref() == Some(commit_sha.as_str()) {
						result.succeeded = succeeded;
						result.url = url.clone();
					}
				}
				entity.status = entity.effective_status();

				if matches!(entity.status, Status::Success | Status::Failure) {
					let mut slot = state.build_slot.lock().await;
					if slot.as_deref() == Some(commit_sha.as_str()) {
						*slot = None;
					}
				}

				state.store.upsert_pull(&entity).await?;
			}

			process_queue(state, &repo_cfg).await
		}
		InboundEvent::PullRequestOpened {
			owner,
			repo,
			number,
			head_sha,
			head_ref,
			base_ref,
		} => {
			let mut entity = state
				.store
				.get_pull(&owner, &repo, number)
				.await?
				.unwrap_or_else(|| PullRequest::new(owner.clone(), repo.clone(), number, head_sha.clone()));
			entity.head_advanced(&head_sha);
			entity.head_ref = head_ref;
			entity.base_ref = base_ref;
			state.store.upsert_pull(&entity).await?;
			Ok(())
		}
		InboundEvent::PullRequestUpdated {
			owner,
			repo,
			number,
			head_sha,
		} => {
			let mut entity = state
				.store
				.get_pull(&owner, &repo, number)
				.await?
				.unwrap_or_else(|| PullRequest::new(owner.clone(), repo.clone(), number, head_sha.clone()));
			entity.head_advanced(&head_sha);
			state.store.upsert_pull(&entity).await?;
			Ok(())
		}
		InboundEvent::PullRequestClosed { owner, repo, number } => {
			if let Some(mut entity) = state.store.get_pull(&owner, &repo, number).await? {
				entity.status = Status::Empty;
				state.store.upsert_pull(&entity).await?;
			}
			Ok(())
		}
	}
}

/// Shared by both comment-shaped events (the conversation tab's issue
/// comments and diff-line review comments): parses directives addressed to
/// the bot, applies the authorized ones, carries out their side effects,
/// and re-runs the queue processor for the repository.
async fn handle_comment(
	state: &AppState,
	owner: String,
	repo: String,
	number: i64,
	author: String,
	body: String,
) -> Result<()> {
	let repo_cfg = state
		.config
		.repo(&owner, &repo)
		.ok_or_else(|| Error::NoCiConfigured {
			repo_label: format!("{}/{}", owner, repo),
		})?
		.clone();

	let parser = CommandParser::new(&state.config.bot_username);
	let parsed = parser.parse(&body);
	if !parsed.mentioned {
		return Ok(());
	}

	let is_authorized = repo_cfg.reviewers.contains(&author) || author == state.config.bot_username;

	let mut entity = state
		.store
		.get_pull(&owner, &repo, number)
		.await?
		.unwrap_or_else(|| PullRequest::new(owner.clone(), repo.clone(), number, String::new()));

	if is_authorized {
		let mut effects = Vec::new();
		for directive in parsed.directives {
			effects.extend(command::apply(&mut entity, directive, &author, true));
		}
		state.store.upsert_pull(&entity).await?;

		for effect in effects {
			match effect {
				Effect::Comment(body) => {
					state.gh_client.create_issue_comment(&owner, &repo, number, &body).await.ok();
				}
				Effect::StopSelectedBuilders => {
					stop_selected_builders(state, &repo_cfg, &owner, &repo, number).await;
				}
			}
		}
	}

	process_queue(state, &repo_cfg).await
}

/// Carries out `force`: POSTs to session CI to stop the builders
/// currently running for this repo's configured builder set, commenting
/// with a `:bomb:` if the request is rejected, per the error-handling
/// design's CI-POST-error recovery.
async fn stop_selected_builders(state: &AppState, repo_cfg: &crate::config::RepoConfig, owner: &str, repo: &str, number: i64) {
	let builders = match &repo_cfg.ci {
		CiKind::Session { builders, .. } => builders.clone(),
		_ => return,
	};
	let ci_client = match &state.ci_client {
		Some(client) => client.clone(),
		None => return,
	};

	let session = match ci_client.login().await {
		Ok(session) => session,
		Err(err) => {
			state
				.gh_client
				.create_issue_comment(
					owner,
					repo,
					number,
					&format!("{} {}", crate::constants::EMOJI_BOMB, err),
				)
				.await
				.ok();
			return;
		}
	};
	let result = ci_client.stop_selected(&session, &builders).await;
	ci_client.logout(&session).await.ok();

	if let Err(err) = result {
		state
			.gh_client
			.create_issue_comment(
				owner,
				repo,
				number,
				&format!("{} {}", crate::constants::EMOJI_BOMB, err),
			)
			.await
			.ok();
	}
}
