use crate::config::{CiKind, RepoConfig};
use crate::constants::*;
use crate::core::AppState;
use crate::entity::{BuildResult, PullRequest, Status};
use crate::error::Error;
use crate::github::{GithubCommitStatusState, GithubPullRequest};
use crate::types::Result;

/// Picks between a cheap rebuild of the previous attempt and a full fresh
/// scratch-merge build, per `startBuildOrRebuild` in §4.4: a rebuild is
/// tried first and only falls back to a fresh build when it isn't
/// eligible or fails its own preconditions.
pub async fn start_build_or_rebuild(
	state: &AppState,
	repo_cfg: &RepoConfig,
	pr: &GithubPullRequest,
	entity: &mut PullRequest,
) -> Result<()> {
	if rebuild_is_eligible(repo_cfg, entity) {
		match start_rebuild(state, repo_cfg, entity).await {
			Ok(()) => return Ok(()),
			Err(err) => {
				log::warn!("{}: rebuild failed, falling back to fresh build: {}", entity.repo_label(), err);
			}
		}
	}
	start_build(state, repo_cfg, pr, entity).await
}

/// The scratch branch and builder set a fresh build is dispatched
/// against, per the CI-shape table in §4.4.1.
fn target_branch_and_builders(repo_cfg: &RepoConfig, try_mode: bool, base_ref: &str) -> (String, Vec<String>) {
	(repo_cfg.scratch_branch(try_mode, base_ref), repo_cfg.builders(try_mode))
}

/// `startBuild`: resets the scratch branch to the base branch's tip,
/// merges the PR's head onto it, and dispatches the resulting commit to
/// CI. Asserts the PR's recorded head SHA still matches the hosting
/// platform's before doing anything, since a stale webhook delivery must
/// not build a commit the PR has already moved past.
pub async fn start_build(
	state: &AppState,
	repo_cfg: &RepoConfig,
	pr: &GithubPullRequest,
	entity: &mut PullRequest,
) -> Result<()> {
	if pr.head.sha != entity.head_sha {
		return Err(Error::StaleHeadSha {
			expected: entity.head_sha.clone(),
			actual: pr.head.sha.clone(),
		});
	}

	let owner = &pr.base.repo.owner.login;
	let repo = &pr.base.repo.name;
	let (branch, builders) = target_branch_and_builders(repo_cfg, entity.try_, &pr.base.ref_field);

	if repo_cfg.ci.is_session() {
		let mut slot = state.build_slot.lock().await;
		if slot.is_some() {
			return Err(Error::CiRequest {
				msg: "build slot already occupied".to_string(),
			});
		}
		*slot = Some(String::new());
	}

	let base_sha = state.gh_client.get_ref(owner, repo, &format!("heads/{}", pr.base.ref_field)).await?;
	state.gh_client.update_ref(owner, repo, &format!("heads/{}", branch), &base_sha).await?;

	let refreshed = state.gh_client.get_pull_request(owner, repo, pr.number).await?;
	entity.title = refreshed.title.clone();
	entity.body = refreshed.body.clone().unwrap_or_default();
	entity.head_ref = format!("{}:{}", refreshed.head.repo.owner.login, refreshed.head.ref_field);
	entity.base_ref = pr.base.ref_field.clone();

	let approver = if entity.try_ {
		"<try>".to_string()
	} else {
		entity.approval.as_ref().map(|a| a.approved_by.clone()).unwrap_or_default()
	};
	let commit_message = merge_commit_message(pr.number, &entity.head_ref, &approver, &entity.title, &entity.body);

	let merge_sha = match state
		.gh_client
		.create_merge_commit(owner, repo, &branch, &pr.head.sha, &commit_message)
		.await
	{
		Ok(sha) => sha,
		Err(Error::MergeConflict { .. }) => {
			entity.status = Status::Error;
			entity.merge_sha = None;
			*state.build_slot.lock().await = None;
			state
				.gh_client
				.create_status(
					owner,
					repo,
					&pr.head.sha,
					GithubCommitStatusState::Error,
					"Merge conflict",
					STATUS_CONTEXT,
				)
				.await
				.ok();
			state
				.gh_client
				.create_issue_comment(owner, repo, pr.number, &format!("{} Merge conflict", EMOJI_LOCK))
				.await
				.ok();
			return Ok(());
		}
		Err(err) => {
			*state.build_slot.lock().await = None;
			return Err(err);
		}
	};

	entity.merge_sha = Some(merge_sha.clone());
	entity.status = Status::Pending;
	entity.build_res.clear();
	for builder in &builders {
		entity.build_res.insert(
			builder.clone(),
			BuildResult {
				url: None,
				succeeded: None,
				merge_sha: Some(merge_sha.clone()),
			},
		);
	}

	if repo_cfg.ci.is_session() {
		*state.build_slot.lock().await = Some(merge_sha.clone());
	}

	let verb = if entity.try_ { "Trying" } else { "Testing" };
	let description = format!(
		"{} commit {} with merge {}...",
		verb,
		short_sha(&pr.head.sha),
		short_sha(&merge_sha),
	);
	report_pending(state, repo_cfg, owner, repo, &merge_sha, &builders, &description).await;
	state
		.gh_client
		.create_issue_comment(owner, repo, pr.number, &format!("{} {}", EMOJI_HOURGLASS, description))
		.await
		.ok();

	Ok(())
}

/// Emits the status check(s) a fresh build is reported under: a single
/// `homu` context for every CI shape except "testrunners", which reports
/// one `merge-test/<builder>` context per builder.
async fn report_pending(
	state: &AppState,
	repo_cfg: &RepoConfig,
	owner: &str,
	repo: &str,
	merge_sha: &str,
	builders: &[String],
	description: &str,
) {
	match &repo_cfg.ci {
		CiKind::TestRunners { .. } => {
			for builder in builders {
				state
					.gh_client
					.create_status(
						owner,
						repo,
						merge_sha,
						GithubCommitStatusState::Pending,
						description,
						&format!("{}{}", STATUS_CONTEXT_PER_BUILDER_PREFIX, builder),
					)
					.await
					.ok();
			}
		}
		_ => {
			state
				.gh_client
				.create_status(owner, repo, merge_sha, GithubCommitStatusState::Pending, description, STATUS_CONTEXT)
				.await
				.ok();
		}
	}
}

/// Eligible when the CI shape is session-based, prior build results
/// exist, every prior builder reported a URL, the set partitions into at
/// least one success and one failure, and the scratch merge's base is
/// still reachable (the reachability check itself happens in
/// `start_rebuild`, since it needs an async platform call).
pub fn rebuild_is_eligible(repo_cfg: &RepoConfig, entity: &PullRequest) -> bool {
	if !repo_cfg.ci.is_session() || entity.build_res.is_empty() {
		return false;
	}
	let all_have_url = entity.build_res.values().all(|r| r.url.is_some());
	let has_success = entity.build_res.values().any(|r| r.succeeded == Some(true));
	let has_failure = entity.build_res.values().any(|r| r.succeeded == Some(false));
	all_have_url && has_success && has_failure
}

/// `startRebuild`: reuses builders that already succeeded and re-requests
/// only the failed ones against the same scratch merge commit, instead of
/// re-merging and re-running everything from scratch.
pub async fn start_rebuild(state: &AppState, repo_cfg: &RepoConfig, entity: &mut PullRequest) -> Result<()> {
	let merge_sha = entity.merge_sha.clone().ok_or_else(|| Error::CiRequest {
		msg: "no scratch merge to rebuild".to_string(),
	})?;

	let base_sha = state
		.gh_client
		.get_ref(&entity.owner, &entity.repo, &format!("heads/{}", entity.base_ref))
		.await
		.unwrap_or_default();
	let parents = state.gh_client.get_commit_parents(&entity.owner, &entity.repo, &merge_sha).await?;
	if !base_sha.is_empty() && !parents.iter().any(|p| p == &base_sha) {
		return Err(Error::CiRequest {
			msg: "scratch merge commit is no longer reachable from the base branch".to_string(),
		});
	}

	let ci_client = state.ci_client.as_ref().ok_or_else(|| Error::NoCiConfigured {
		repo_label: repo_cfg_label(repo_cfg),
	})?;

	state
		.gh_client
		.update_ref(&entity.owner, &entity.repo, "tags/homu-tmp", &merge_sha)
		.await
		.ok();

	let session = ci_client.login().await?;
	let mut reused = vec![];
	let mut rebuilt = vec![];
	let mut failed: Option<(String, Error)> = None;
	for (builder, result) in entity.build_res.iter() {
		if result.succeeded == Some(true) {
			reused.push((builder.clone(), result.url.clone()));
			continue;
		}
		let url = match result.url.as_deref() {
			Some(url) => url,
			None => {
				failed = Some((
					builder.clone(),
					Error::CiRequest {
						msg: format!("builder {} has no prior build URL to rebuild", builder),
					},
				));
				break;
			}
		};
		if let Err(err) = ci_client.rebuild(&session, builder, url).await {
			failed = Some((builder.clone(), err));
			break;
		}
		rebuilt.push(builder.clone());
	}
	ci_client.logout(&session).await.ok();

	if let Some((builder, err)) = failed {
		let msg = format!("{} Could not rebuild `{}`: {}", EMOJI_BOMB, builder, err);
		state.gh_client.create_issue_comment(&entity.owner, &entity.repo, entity.number, &msg).await.ok();
		return Err(err);
	}

	for (builder, result) in entity.build_res.iter_mut() {
		if rebuilt.contains(builder) {
			result.succeeded = None;
			result.merge_sha = Some(merge_sha.clone());
		}
	}
	entity.status = Status::Pending;

	state
		.gh_client
		.create_status(
			&entity.owner,
			&entity.repo,
			&merge_sha,
			GithubCommitStatusState::Pending,
			"Previous build results are reusable. Rebuilding...",
			STATUS_CONTEXT,
		)
		.await
		.ok();

	let mut msg = format!("{} Previous build results are reusable. Rebuilding...\n\n", EMOJI_ZAP);
	if !reused.is_empty() {
		msg.push_str("Reused:\n");
		for (builder, url) in &reused {
			match url {
				Some(url) => msg.push_str(&format!("* [{}]({})\n", builder, url)),
				None => msg.push_str(&format!("* {}\n", builder)),
			}
		}
	}
	if !rebuilt.is_empty() {
		msg.push_str("Rebuilding:\n");
		for builder in &rebuilt {
			msg.push_str(&format!("* {}\n", builder));
		}
	}
	state.gh_client.create_issue_comment(&entity.owner, &entity.repo, entity.number, &msg).await.ok();

	Ok(())
}

/// Fast-forwards the base branch to a PR's tested scratch-merge commit,
/// the step that actually lands a change once its build has succeeded
/// and it is still approved at that head. Releases the build slot if it
/// is still holding this attempt's merge SHA, and clears the PR's
/// in-flight attempt so it reads as idle again afterward.
pub async fn land(state: &AppState, entity: &mut PullRequest) -> Result<()> {
	let merge_sha = entity.merge_sha.clone().ok_or_else(|| Error::CiRequest {
		msg: "no tested merge commit to land".to_string(),
	})?;

	state
		.gh_client
		.update_ref(&entity.owner, &entity.repo, &format!("heads/{}", entity.base_ref), &merge_sha)
		.await?;

	let mut slot = state.build_slot.lock().await;
	if slot.as_deref() == Some(merge_sha.as_str()) {
		*slot = None;
	}
	drop(slot);

	entity.merge_sha = None;
	entity.build_res.clear();
	entity.status = Status::Empty;
	entity.approval = None;

	state
		.gh_client
		.create_issue_comment(
			&entity.owner,
			&entity.repo,
			entity.number,
			&format!("{} Landed in {}.", EMOJI_PUSHPIN, short_sha(&merge_sha)),
		)
		.await
		.ok();

	log::info!("{}: landed {} on {}", entity.repo_label(), short_sha(&merge_sha), entity.base_ref);
	Ok(())
}

fn short_sha(sha: &str) -> &str {
	&sha[..sha.len().min(7)]
}

fn repo_cfg_label(repo_cfg: &RepoConfig) -> String {
	format!("{}/{}", repo_cfg.owner, repo_cfg.repo)
}

/// The scratch-merge commit message, following the literal format: `Auto
/// merge of #N - headRef, r=approver`, with the approver spelled `<try>`
/// in try-mode.
fn merge_commit_message(number: i64, head_ref: &str, approver: &str, title: &str, body: &str) -> String {
	format!("Auto merge of #{} - {}, r={}\n\n{}\n\n{}", number, head_ref, approver, title, body)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::BranchNames;

	fn session_repo_cfg() -> RepoConfig {
		RepoConfig {
			owner: "acme".into(),
			repo: "widgets".into(),
			reviewers: vec!["reviewer".into()],
			ci: CiKind::Session {
				builders: vec!["builder-a".into(), "builder-b".into()],
				try_builders: vec![],
			},
			branch_names: BranchNames::default(),
		}
	}

	#[test]
	fn merge_commit_message_matches_the_literal_format() {
		let msg = merge_commit_message(42, "alice:feature", "bob", "Add feature", "Adds a thing.");
		assert_eq!(msg, "Auto merge of #42 - alice:feature, r=bob\n\nAdd feature\n\nAdds a thing.");
	}

	#[test]
	fn try_mode_merge_commit_message_spells_out_try() {
		let msg = merge_commit_message(7, "alice:wip", "<try>", "Try something", "");
		assert_eq!(msg, "Auto merge of #7 - alice:wip, r=<try>\n\nTry something\n\n");
	}

	#[test]
	fn rebuild_not_eligible_without_mixed_results() {
		let repo_cfg = session_repo_cfg();
		let mut pr = PullRequest::new("acme".into(), "widgets".into(), 42, "abc1234".into());
		pr.build_res.insert(
			"builder-a".into(),
			BuildResult { url: Some("http://ci/1".into()), succeeded: Some(true), merge_sha: Some("m1".into()) },
		);
		assert!(!rebuild_is_eligible(&repo_cfg, &pr));
	}

	#[test]
	fn rebuild_eligible_with_success_and_failure() {
		let repo_cfg = session_repo_cfg();
		let mut pr = PullRequest::new("acme".into(), "widgets".into(), 42, "abc1234".into());
		pr.build_res.insert(
			"builder-a".into(),
			BuildResult { url: Some("http://ci/1".into()), succeeded: Some(true), merge_sha: Some("m1".into()) },
		);
		pr.build_res.insert(
			"builder-b".into(),
			BuildResult { url: Some("http://ci/2".into()), succeeded: Some(false), merge_sha: Some("m1".into()) },
		);
		assert!(rebuild_is_eligible(&repo_cfg, &pr));
	}

	#[test]
	fn rebuild_not_eligible_for_non_session_ci() {
		let mut repo_cfg = session_repo_cfg();
		repo_cfg.ci = CiKind::Travis;
		let mut pr = PullRequest::new("acme".into(), "widgets".into(), 42, "abc1234".into());
		pr.build_res.insert(
			"travis".into(),
			BuildResult { url: Some("http://ci/1".into()), succeeded: Some(false), merge_sha: Some("m1".into()) },
		);
		assert!(!rebuild_is_eligible(&repo_cfg, &pr));
	}
}
