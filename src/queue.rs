use crate::config::RepoConfig;
use crate::core::AppState;
use crate::dispatcher::{land, start_build, start_build_or_rebuild};
use crate::entity::Status;
use crate::error::log_and_continue;
use crate::types::Result;

/// Scans one repository's tracked pull requests and decides what to build
/// next. Runs under `queue_handler_lock`, so only one repository's queue
/// is ever being decided at a time process-wide.
///
/// Two passes, mirroring `process_queue` in the original:
///
/// 1. Walk PRs in `sort_key` order. The first PR found with a pending
///    (non-try) build means a build is already in flight for this repo;
///    stop here rather than starting a second one. A real, approved PR
///    whose build just succeeded is landed: its merge commit is
///    fast-forwarded onto the base branch. Any approved PR with no
///    build yet gets one started. A PR whose try build already
///    succeeded is promoted to a real build by clearing its `try_` flag
///    and starting a fresh (non-rebuild) build.
/// 2. If no real build was started in pass one, start a try-only build
///    for the first eligible `try`-flagged PR, also never attempting a
///    rebuild.
pub async fn process_queue(state: &AppState, repo_cfg: &RepoConfig) -> Result<()> {
	let _guard = state.queue_handler_lock.lock().await;

	let mut entities = state.store.list_repo(&repo_cfg.owner, &repo_cfg.repo).await?;
	for entity in entities.iter_mut() {
		prune_unconfigured_builders(state, repo_cfg, entity).await?;
	}
	entities.sort_by_key(|e| e.sort_key());

	let mut started_real_build = false;
	for entity in entities.iter_mut() {
		if entity.status == Status::Pending && !entity.try_ {
			started_real_build = true;
			break;
		}

		if entity.status == Status::Success && !entity.try_ && entity.is_approved() {
			log_and_continue(&format!("landing {}", entity.repo_label()), land(state, entity).await);
			state.store.upsert_pull(entity).await?;
			started_real_build = true;
			break;
		}

		if entity.status == Status::Success && entity.try_ && entity.is_approved() {
			entity.try_ = false;
			entity.status = Status::Empty;
			let pr = state
				.gh_client
				.get_pull_request(&repo_cfg.owner, &repo_cfg.repo, entity.number)
				.await?;
			log_and_continue(
				&format!("starting promoted build for {}", entity.repo_label()),
				start_build(state, repo_cfg, &pr, entity).await,
			);
			state.store.upsert_pull(entity).await?;
			started_real_build = true;
			break;
		}

		if entity.status == Status::Empty && entity.is_approved() {
			let pr = state
				.gh_client
				.get_pull_request(&repo_cfg.owner, &repo_cfg.repo, entity.number)
				.await?;
			log_and_continue(
				&format!("starting build for {}", entity.repo_label()),
				start_build_or_rebuild(state, repo_cfg, &pr, entity).await,
			);
			state.store.upsert_pull(entity).await?;
			started_real_build = true;
			break;
		}
	}

	if started_real_build {
		return Ok(());
	}

	for entity in entities.iter_mut() {
		if entity.status == Status::Empty && entity.try_ {
			let pr = state
				.gh_client
				.get_pull_request(&repo_cfg.owner, &repo_cfg.repo, entity.number)
				.await?;
			log_and_continue(
				&format!("starting try build for {}", entity.repo_label()),
				start_build(state, repo_cfg, &pr, entity).await,
			);
			state.store.upsert_pull(entity).await?;
			break;
		}
	}

	Ok(())
}

/// Drops any recovered `build_res` row for a builder no longer present in
/// the repository's configuration (e.g. a builder renamed or retired since
/// the row was written), per the recovery invariant that every surviving
/// row's builder must be in the PR's configured builder set.
async fn prune_unconfigured_builders(
	state: &AppState,
	repo_cfg: &RepoConfig,
	entity: &mut crate::entity::PullRequest,
) -> Result<()> {
	let mut configured = repo_cfg.builders(false);
	configured.extend(repo_cfg.builders(true));
	let before = entity.build_res.len();
	entity.build_res.retain(|builder, _| configured.contains(builder));
	if entity.build_res.len() != before {
		state.store.upsert_pull(entity).await?;
	}
	Ok(())
}

/// Runs `process_queue` across every configured repository in round-robin
/// order, so no single repository can starve the others of scheduling
/// attention. Adopted in place of the original's unordered dict iteration,
/// per the redesign note on cross-repository fairness.
pub async fn process_all_queues(state: &AppState) -> Result<()> {
	for repo_cfg in &state.config.repos {
		log_and_continue(
			&format!("processing queue for {}/{}", repo_cfg.owner, repo_cfg.repo),
			process_queue(state, repo_cfg).await,
		);
	}
	Ok(())
}
