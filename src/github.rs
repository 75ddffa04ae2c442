use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::borrow::Cow;

use crate::error::{self, Error};
use crate::types::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRepo {
	pub name: String,
	pub owner: GithubUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
	pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubBranch {
	pub sha: String,
	#[serde(rename = "ref")]
	pub ref_field: String,
	pub repo: GithubRepo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubPullRequest {
	pub number: i64,
	pub html_url: String,
	pub title: String,
	pub body: Option<String>,
	pub merged: bool,
	pub head: GithubBranch,
	pub base: GithubBranch,
	pub updated_at: chrono::DateTime<chrono::Utc>,
	/// `null` while GitHub is still computing mergeability; the prober
	/// retries until this resolves to `Some(_)`.
	#[serde(default)]
	pub mergeable: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubComment {
	pub id: i64,
	pub body: String,
	pub user: GithubUser,
}

/// A review comment, which (unlike an issue comment) is bound to the
/// commit it was left on. The synchronizer only replays one whose
/// `original_commit_id` still matches the PR's current head.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubReviewComment {
	pub id: i64,
	pub body: String,
	pub user: GithubUser,
	pub original_commit_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GithubCommitStatusState {
	Pending,
	Success,
	Error,
	Failure,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubCommitStatus {
	pub id: i64,
	pub context: String,
	pub state: GithubCommitStatusState,
	pub description: Option<String>,
	pub target_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct MergeRequestBody<'a> {
	base: &'a str,
	head: &'a str,
	commit_message: &'a str,
}

/// Capability list for talking to the hosting platform: reading and
/// commenting on pull requests, creating the scratch-merge commit the
/// dispatcher builds CI against, and reading back commit statuses. Kept as
/// a trait so tests can substitute an in-memory fake.
#[async_trait]
pub trait GithubClient: Send + Sync {
	async fn get_pull_request(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
	) -> Result<GithubPullRequest>;

	async fn list_open_pull_requests(
		&self,
		owner: &str,
		repo: &str,
	) -> Result<Vec<GithubPullRequest>>;

	async fn create_issue_comment(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
		body: &str,
	) -> Result<()>;

	async fn list_issue_comments(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
	) -> Result<Vec<GithubComment>>;

	/// Review comments left directly on a diff line, each bound to the
	/// commit it was posted against via `original_commit_id`.
	async fn list_review_comments(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
	) -> Result<Vec<GithubReviewComment>>;

	/// Resolves `heads/<branch>` (or any ref) to the commit SHA it
	/// currently points at.
	async fn get_ref(&self, owner: &str, repo: &str, ref_name: &str) -> Result<String>;

	/// Force-moves a ref to `sha`, creating it if absent. Used to reset
	/// the scratch branch to the base branch's tip before merging the
	/// PR's head onto it.
	async fn update_ref(&self, owner: &str, repo: &str, ref_name: &str, sha: &str) -> Result<()>;

	/// Creates (or updates) a scratch ref at `base` merged with `head`,
	/// returning the resulting merge commit SHA. Maps a 409 response into
	/// `Error::MergeConflict`.
	async fn create_merge_commit(
		&self,
		owner: &str,
		repo: &str,
		base: &str,
		head: &str,
		commit_message: &str,
	) -> Result<String>;

	/// The parent commit SHAs of `commit_sha`, used to check that a
	/// scratch merge commit is still reachable from the base branch
	/// before reusing it for a rebuild.
	async fn get_commit_parents(&self, owner: &str, repo: &str, commit_sha: &str) -> Result<Vec<String>>;

	async fn get_commit_statuses(
		&self,
		owner: &str,
		repo: &str,
		commit_sha: &str,
	) -> Result<Vec<GithubCommitStatus>>;

	/// Creates a commit status check against `commit_sha`.
	async fn create_status(
		&self,
		owner: &str,
		repo: &str,
		commit_sha: &str,
		state: GithubCommitStatusState,
		description: &str,
		context: &str,
	) -> Result<()>;

	/// Remaining core-API calls and the Unix epoch second at which the
	/// current rate-limit window resets. Used at startup to decide whether
	/// to wait out an exhausted window before the initial synchronize pass.
	async fn rate_limit_status(&self) -> Result<RateLimitStatus>;
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
	pub remaining: i64,
	pub reset_at: i64,
}

pub struct HttpGithubClient {
	client: reqwest::Client,
	auth_token: String,
	base_url: String,
}

impl HttpGithubClient {
	pub fn new(auth_token: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			auth_token: auth_token.into(),
			base_url: "https://api.github.com".to_string(),
		}
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
		let request = builder
			.bearer_auth(&self.auth_token)
			.header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
			.header(reqwest::header::USER_AGENT, "merge-queue-bot/0.1")
			.build()
			.context(error::Http)?;

		let response = self.client.execute(request).await.context(error::Http)?;
		let status = response.status();

		if status.is_success() {
			Ok(response)
		} else if status == reqwest::StatusCode::CONFLICT {
			Err(Error::MergeConflict {
				commit_sha: String::new(),
			})
		} else {
			let text = response.text().await.context(error::Http)?;
			let body = serde_json::from_str(&text)
				.unwrap_or_else(|_| serde_json::json!({ "error_message": text }));
			Err(Error::Response { status, body })
		}
	}

	async fn get<'b, I, T>(&self, url: I) -> Result<T>
	where
		I: Into<Cow<'b, str>>,
		T: serde::de::DeserializeOwned,
	{
		self.request(self.client.get(&*url.into()))
			.await?
			.json::<T>()
			.await
			.context(error::Http)
	}

	/// Follows `Link: rel="next"` headers to collect every page of a
	/// paginated list endpoint, the same pagination scheme the teacher's
	/// HTTP client follows.
	async fn get_all<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<Vec<T>> {
		let mut entities = Vec::new();
		let mut next = Some(url);

		while let Some(url) = next {
			let response = self.request(self.client.get(&url)).await?;
			next = parse_next_link(response.headers());
			let mut page = response.json::<Vec<T>>().await.context(error::Http)?;
			entities.append(&mut page);
		}

		Ok(entities)
	}
}

fn parse_next_link(headers: &reqwest::header::HeaderMap) -> Option<String> {
	let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
	link.split(',').find_map(|part| {
		let mut segments = part.split(';');
		let url_part = segments.next()?.trim();
		let is_next = segments.any(|s| s.trim() == "rel=\"next\"");
		if is_next {
			Some(url_part.trim_start_matches('<').trim_end_matches('>').to_string())
		} else {
			None
		}
	})
}

#[async_trait]
impl GithubClient for HttpGithubClient {
	async fn get_pull_request(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
	) -> Result<GithubPullRequest> {
		self.get(self.url(&format!("/repos/{}/{}/pulls/{}", owner, repo, number)))
			.await
	}

	async fn list_open_pull_requests(
		&self,
		owner: &str,
		repo: &str,
	) -> Result<Vec<GithubPullRequest>> {
		self.get_all(self.url(&format!(
			"/repos/{}/{}/pulls?state=open&per_page=100",
			owner, repo
		)))
		.await
	}

	async fn create_issue_comment(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
		body: &str,
	) -> Result<()> {
		#[derive(Serialize)]
		struct Body<'a> {
			body: &'a str,
		}
		self.request(
			self.client
				.post(self.url(&format!(
					"/repos/{}/{}/issues/{}/comments",
					owner, repo, number
				)))
				.json(&Body { body }),
		)
		.await?;
		Ok(())
	}

	async fn list_issue_comments(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
	) -> Result<Vec<GithubComment>> {
		self.get_all(self.url(&format!(
			"/repos/{}/{}/issues/{}/comments?per_page=100",
			owner, repo, number
		)))
		.await
	}

	async fn list_review_comments(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
	) -> Result<Vec<GithubReviewComment>> {
		self.get_all(self.url(&format!(
			"/repos/{}/{}/pulls/{}/comments?per_page=100",
			owner, repo, number
		)))
		.await
	}

	async fn get_ref(&self, owner: &str, repo: &str, ref_name: &str) -> Result<String> {
		#[derive(Deserialize)]
		struct RefObject {
			sha: String,
		}
		#[derive(Deserialize)]
		struct RefResponse {
			object: RefObject,
		}
		let response: RefResponse = self
			.get(self.url(&format!("/repos/{}/{}/git/ref/{}", owner, repo, ref_name)))
			.await?;
		Ok(response.object.sha)
	}

	async fn update_ref(&self, owner: &str, repo: &str, ref_name: &str, sha: &str) -> Result<()> {
		#[derive(Serialize)]
		struct UpdateRefBody<'a> {
			sha: &'a str,
			force: bool,
		}
		let result = self
			.request(
				self.client
					.patch(self.url(&format!("/repos/{}/{}/git/refs/{}", owner, repo, ref_name)))
					.json(&UpdateRefBody { sha, force: true }),
			)
			.await;
		match result {
			Ok(_) => Ok(()),
			// A non-existent ref (first build on this repo) needs to be
			// created instead of patched.
			Err(Error::Response { status, .. }) if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY => {
				#[derive(Serialize)]
				struct CreateRefBody<'a> {
					#[serde(rename = "ref")]
					ref_field: String,
					sha: &'a str,
				}
				self.request(
					self.client
						.post(self.url(&format!("/repos/{}/{}/git/refs", owner, repo)))
						.json(&CreateRefBody {
							ref_field: format!("refs/{}", ref_name),
							sha,
						}),
				)
				.await?;
				Ok(())
			}
			Err(err) => Err(err),
		}
	}

	async fn create_merge_commit(
		&self,
		owner: &str,
		repo: &str,
		base: &str,
		head: &str,
		commit_message: &str,
	) -> Result<String> {
		#[derive(Deserialize)]
		struct MergeResponse {
			sha: String,
		}
		let result = self
			.request(
				self.client
					.post(self.url(&format!("/repos/{}/{}/merges", owner, repo)))
					.json(&MergeRequestBody {
						base,
						head,
						commit_message,
					}),
			)
			.await;
		match result {
			Ok(response) => Ok(response
				.json::<MergeResponse>()
				.await
				.context(error::Http)?
				.sha),
			Err(Error::MergeConflict { .. }) => Err(Error::MergeConflict {
				commit_sha: head.to_string(),
			}),
			Err(err) => Err(err),
		}
	}

	async fn get_commit_parents(&self, owner: &str, repo: &str, commit_sha: &str) -> Result<Vec<String>> {
		#[derive(Deserialize)]
		struct ParentRef {
			sha: String,
		}
		#[derive(Deserialize)]
		struct CommitResponse {
			parents: Vec<ParentRef>,
		}
		let response: CommitResponse = self
			.get(self.url(&format!("/repos/{}/{}/commits/{}", owner, repo, commit_sha)))
			.await?;
		Ok(response.parents.into_iter().map(|p| p.sha).collect())
	}

	async fn get_commit_statuses(
		&self,
		owner: &str,
		repo: &str,
		commit_sha: &str,
	) -> Result<Vec<GithubCommitStatus>> {
		self.get_all(self.url(&format!(
			"/repos/{}/{}/commits/{}/statuses?per_page=100",
			owner, repo, commit_sha
		)))
		.await
	}

	async fn create_status(
		&self,
		owner: &str,
		repo: &str,
		commit_sha: &str,
		state: GithubCommitStatusState,
		description: &str,
		context: &str,
	) -> Result<()> {
		#[derive(Serialize)]
		struct Body<'a> {
			state: GithubCommitStatusState,
			description: &'a str,
			context: &'a str,
		}
		self.request(
			self.client
				.post(self.url(&format!("/repos/{}/{}/statuses/{}", owner, repo, commit_sha)))
				.json(&Body {
					state,
					description,
					context,
				}),
		)
		.await?;
		Ok(())
	}

	async fn rate_limit_status(&self) -> Result<RateLimitStatus> {
		#[derive(Deserialize)]
		struct RateLimitResponse {
			resources: RateLimitResources,
		}
		#[derive(Deserialize)]
		struct RateLimitResources {
			core: RateLimitCore,
		}
		#[derive(Deserialize)]
		struct RateLimitCore {
			remaining: i64,
			reset: i64,
		}
		let response: RateLimitResponse = self.get(self.url("/rate_limit")).await?;
		Ok(RateLimitStatus {
			remaining: response.resources.core.remaining,
			reset_at: response.resources.core.reset,
		})
	}
}
