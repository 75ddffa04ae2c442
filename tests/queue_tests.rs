use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use merge_queue_bot::config::{BranchNames, CiKind, Config, RepoConfig};
use merge_queue_bot::core::AppState;
use merge_queue_bot::entity::{Approval, PullRequest, Status};
use merge_queue_bot::error::Error;
use merge_queue_bot::github::{
	GithubBranch, GithubClient, GithubComment, GithubCommitStatus, GithubCommitStatusState,
	GithubPullRequest, GithubRepo, GithubReviewComment, GithubUser, RateLimitStatus,
};
use merge_queue_bot::queue::process_queue;
use merge_queue_bot::store::Store;
use merge_queue_bot::types::Result;

/// An in-memory stand-in for the hosting platform, holding just enough
/// state to drive the queue processor through a scenario without any
/// network access.
struct FakeGithubClient {
	pulls: Mutex<HashMap<i64, GithubPullRequest>>,
	comments: Mutex<Vec<String>>,
	merge_conflict_heads: Mutex<Vec<String>>,
}

impl FakeGithubClient {
	fn new() -> Self {
		Self {
			pulls: Mutex::new(HashMap::new()),
			comments: Mutex::new(Vec::new()),
			merge_conflict_heads: Mutex::new(Vec::new()),
		}
	}

	async fn insert_pr(&self, number: i64, head_sha: &str) {
		let pr = GithubPullRequest {
			number,
			html_url: format!("https://github.com/acme/widgets/pull/{}", number),
			title: "Add feature".to_string(),
			body: Some("Adds a feature.".to_string()),
			merged: false,
			head: GithubBranch {
				sha: head_sha.to_string(),
				ref_field: format!("pr-{}", number),
				repo: GithubRepo {
					name: "widgets".to_string(),
					owner: GithubUser { login: "acme".to_string() },
				},
			},
			base: GithubBranch {
				sha: "base0000".to_string(),
				ref_field: "master".to_string(),
				repo: GithubRepo {
					name: "widgets".to_string(),
					owner: GithubUser { login: "acme".to_string() },
				},
			},
			updated_at: Utc::now(),
			mergeable: Some(true),
		};
		self.pulls.lock().await.insert(number, pr);
	}
}

#[async_trait]
impl GithubClient for FakeGithubClient {
	async fn get_pull_request(&self, _owner: &str, _repo: &str, number: i64) -> Result<GithubPullRequest> {
		self.pulls
			.lock()
			.await
			.get(&number)
			.cloned()
			.ok_or_else(|| Error::MissingField { field: "pull_request".to_string() })
	}

	async fn list_open_pull_requests(&self, _owner: &str, _repo: &str) -> Result<Vec<GithubPullRequest>> {
		Ok(self.pulls.lock().await.values().cloned().collect())
	}

	async fn create_issue_comment(&self, _owner: &str, _repo: &str, _number: i64, body: &str) -> Result<()> {
		self.comments.lock().await.push(body.to_string());
		Ok(())
	}

	async fn list_issue_comments(&self, _owner: &str, _repo: &str, _number: i64) -> Result<Vec<GithubComment>> {
		Ok(vec![])
	}

	async fn list_review_comments(&self, _owner: &str, _repo: &str, _number: i64) -> Result<Vec<GithubReviewComment>> {
		Ok(vec![])
	}

	async fn get_ref(&self, _owner: &str, _repo: &str, _ref_name: &str) -> Result<String> {
		Ok("base0000".to_string())
	}

	async fn update_ref(&self, _owner: &str, _repo: &str, _ref_name: &str, _sha: &str) -> Result<()> {
		Ok(())
	}

	async fn create_merge_commit(
		&self,
		_owner: &str,
		_repo: &str,
		_base: &str,
		head: &str,
		_commit_message: &str,
	) -> Result<String> {
		if self.merge_conflict_heads.lock().await.contains(&head.to_string()) {
			return Err(Error::MergeConflict { commit_sha: head.to_string() });
		}
		Ok(format!("merge-{}", head))
	}

	async fn get_commit_parents(&self, _owner: &str, _repo: &str, _commit_sha: &str) -> Result<Vec<String>> {
		Ok(vec!["base0000".to_string()])
	}

	async fn get_commit_statuses(&self, _owner: &str, _repo: &str, _commit_sha: &str) -> Result<Vec<GithubCommitStatus>> {
		Ok(vec![])
	}

	async fn create_status(
		&self,
		_owner: &str,
		_repo: &str,
		_commit_sha: &str,
		_state: GithubCommitStatusState,
		_description: &str,
		_context: &str,
	) -> Result<()> {
		Ok(())
	}

	async fn rate_limit_status(&self) -> Result<RateLimitStatus> {
		Ok(RateLimitStatus { remaining: 5000, reset_at: 0 })
	}
}

fn stateless_repo_cfg() -> RepoConfig {
	RepoConfig {
		owner: "acme".to_string(),
		repo: "widgets".to_string(),
		reviewers: vec!["maintainer".to_string()],
		ci: CiKind::Status,
		branch_names: BranchNames::default(),
	}
}

async fn test_state(repo_cfg: RepoConfig, gh: Arc<FakeGithubClient>) -> AppState {
	let store = Store::in_memory().await.unwrap();
	let config = Config {
		bot_username: "bot".to_string(),
		listen_addr: "127.0.0.1:0".to_string(),
		webhook_secret: "secret".to_string(),
		github: Default::default(),
		repos: vec![repo_cfg],
	};
	AppState::new(store, gh, None, config)
}

#[tokio::test]
async fn approved_pr_starts_a_build() {
	let gh = Arc::new(FakeGithubClient::new());
	gh.insert_pr(1, "abc1234").await;
	let repo_cfg = stateless_repo_cfg();
	let state = test_state(repo_cfg.clone(), gh.clone()).await;

	let mut entity = PullRequest::new("acme".into(), "widgets".into(), 1, "abc1234".into());
	entity.approval = Some(Approval {
		approved_by: "maintainer".into(),
		approved_sha: "abc1234".into(),
	});
	state.store.upsert_pull(&entity).await.unwrap();

	process_queue(&state, &repo_cfg).await.unwrap();

	let loaded = state.store.get_pull("acme", "widgets", 1).await.unwrap().unwrap();
	assert_eq!(loaded.status, Status::Pending);
	assert!(loaded.merge_sha.is_some());
}

#[tokio::test]
async fn unapproved_pr_is_left_alone() {
	let gh = Arc::new(FakeGithubClient::new());
	gh.insert_pr(2, "def5678").await;
	let repo_cfg = stateless_repo_cfg();
	let state = test_state(repo_cfg.clone(), gh.clone()).await;

	let entity = PullRequest::new("acme".into(), "widgets".into(), 2, "def5678".into());
	state.store.upsert_pull(&entity).await.unwrap();

	process_queue(&state, &repo_cfg).await.unwrap();

	let loaded = state.store.get_pull("acme", "widgets", 2).await.unwrap().unwrap();
	assert_eq!(loaded.status, Status::Empty);
}

#[tokio::test]
async fn force_push_clears_stale_approval() {
	let mut entity = PullRequest::new("acme".into(), "widgets".into(), 3, "aaa0000".into());
	entity.approval = Some(Approval {
		approved_by: "maintainer".into(),
		approved_sha: "aaa0000".into(),
	});
	entity.status = Status::Pending;

	entity.head_advanced("bbb1111");

	assert!(entity.approval.is_none());
	assert_eq!(entity.status, Status::Empty);
	assert_eq!(entity.head_sha, "bbb1111");
}

#[tokio::test]
async fn merge_conflict_is_reported_and_blocks_build() {
	let gh = Arc::new(FakeGithubClient::new());
	gh.insert_pr(4, "ccc2222").await;
	gh.merge_conflict_heads.lock().await.push("ccc2222".to_string());
	let repo_cfg = stateless_repo_cfg();
	let state = test_state(repo_cfg.clone(), gh.clone()).await;

	let mut entity = PullRequest::new("acme".into(), "widgets".into(), 4, "ccc2222".into());
	entity.approval = Some(Approval {
		approved_by: "maintainer".into(),
		approved_sha: "ccc2222".into(),
	});
	state.store.upsert_pull(&entity).await.unwrap();

	process_queue(&state, &repo_cfg).await.unwrap();

	assert!(gh.comments.lock().await.iter().any(|c| c.contains("Merge conflict")));
	let loaded = state.store.get_pull("acme", "widgets", 4).await.unwrap().unwrap();
	assert!(loaded.merge_sha.is_none());
}

#[tokio::test]
async fn successful_real_build_lands_and_clears_the_attempt() {
	let gh = Arc::new(FakeGithubClient::new());
	gh.insert_pr(5, "eee3333").await;
	let repo_cfg = stateless_repo_cfg();
	let state = test_state(repo_cfg.clone(), gh.clone()).await;

	let mut entity = PullRequest::new("acme".into(), "widgets".into(), 5, "eee3333".into());
	entity.approval = Some(Approval {
		approved_by: "maintainer".into(),
		approved_sha: "eee3333".into(),
	});
	entity.merge_sha = Some("merge-eee3333".into());
	entity.status = Status::Success;
	state.store.upsert_pull(&entity).await.unwrap();

	process_queue(&state, &repo_cfg).await.unwrap();

	let loaded = state.store.get_pull("acme", "widgets", 5).await.unwrap().unwrap();
	assert_eq!(loaded.status, Status::Empty);
	assert!(loaded.merge_sha.is_none());
	assert!(gh.comments.lock().await.iter().any(|c| c.contains("Landed")));
}
