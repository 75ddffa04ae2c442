use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The build/merge status a pull request is currently in. Distinct from the
/// hosting platform's commit status: this tracks the queue's own view of
/// where the PR sits in the merge pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
	/// No build has been requested; the PR is idle.
	Empty,
	/// A scratch-merge build was dispatched and CI has not reported yet.
	Pending,
	/// The scratch-merge build passed and the PR is eligible to merge.
	Success,
	/// The scratch-merge build failed.
	Failure,
	/// Something about the merge itself (conflict, platform error) blocked
	/// progress; distinct from a CI failure.
	Error,
}


impl Default for Status {
	fn default() -> Self {
		Status::Empty
	}
}

/// Login of the user who approved a PR, carried alongside the SHA they
/// approved at so that a force-push invalidates the approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
	pub approved_by: String,
	pub approved_sha: String,
}

/// A single builder's outcome within a session-CI build, keyed by builder
/// name (`build_res` in the original).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
	pub url: Option<String>,
	pub succeeded: Option<bool>,
	pub merge_sha: Option<String>,
}

/// The queue's in-memory view of a pull request. Persisted to the store's
/// `pull` table; `build_res` and `mergeable` are tracked in their own
/// tables and folded in here when an entity is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
	pub owner: String,
	pub repo: String,
	pub number: i64,
	pub head_sha: String,
	pub head_ref: String,
	pub base_ref: String,
	pub title: String,
	pub body: String,

	pub status: Status,
	pub approval: Option<Approval>,
	pub priority: i32,
	pub try_: bool,
	pub rollup: bool,

	pub mergeable: Option<bool>,
	pub build_res: BTreeMap<String, BuildResult>,

	/// Set when a build is in flight; the scratch-merge SHA produced for
	/// the current attempt.
	pub merge_sha: Option<String>,

	/// Synchronizer-only hint, never written to the `pull` table. See
	/// the data model notes on why this field is not part of the schema.
	#[serde(skip)]
	pub updated_at: Option<DateTime<Utc>>,
}

impl PullRequest {
	pub fn new(owner: String, repo: String, number: i64, head_sha: String) -> Self {
		Self {
			owner,
			repo,
			number,
			head_sha,
			head_ref: String::new(),
			base_ref: String::new(),
			title: String::new(),
			body: String::new(),
			status: Status::Empty,
			approval: None,
			priority: 0,
			try_: false,
			rollup: false,
			mergeable: None,
			build_res: BTreeMap::new(),
			merge_sha: None,
			updated_at: None,
		}
	}

	pub fn repo_label(&self) -> String {
		format!("{}/{}", self.owner, self.repo)
	}

	/// True once a human (not the bot itself) has approved the PR at its
	/// current head SHA.
	pub fn is_approved(&self) -> bool {
		self.approval
			.as_ref()
			.map(|a| a.approved_sha == self.head_sha)
			.unwrap_or(false)
	}

	/// The `effectiveStatus` derived field from the data model: an
	/// unbuilt-but-approved PR (that isn't known unmergeable) reads as
	/// `approved` rather than `empty`, which is what gives it priority
	/// over a merely-opened PR in the ordering key below.
	fn status_rank(&self) -> u8 {
		match self.status {
			Status::Success => 0,
			Status::Pending => 1,
			Status::Empty if self.is_approved() && self.mergeable != Some(false) => 2,
			Status::Empty => 3,
			Status::Error => 4,
			Status::Failure => 5,
		}
	}

	/// Invalidates any pending build/approval state when the head SHA
	/// changes, mirroring `head_advanced` in the original: a force-push
	/// must not let a stale approval or build result carry over.
	pub fn head_advanced(&mut self, new_sha: &str) {
		if self.head_sha == new_sha {
			return;
		}
		self.head_sha = new_sha.to_string();
		self.status = Status::Empty;
		self.mergeable = None;
		self.merge_sha = None;
		self.build_res.clear();
		if let Some(approval) = &self.approval {
			if approval.approved_sha != new_sha {
				self.approval = None;
			}
		}
	}

	/// The tuple the queue processor sorts candidate PRs by. Lower sorts
	/// first. Mirrors `PullReqState.sort_key` in the original: PRs that
	/// are closer to done (by status), that are known mergeable, and that
	/// are approved are scanned ahead of the rest; among those, a
	/// rollup-eligible PR yields to one that isn't, since rollups are
	/// meant to ride along behind heavier changes; ties are broken by
	/// explicit priority then PR number for determinism.
	pub fn sort_key(&self) -> (u8, u8, u8, u8, i32, i64) {
		(
			self.status_rank(),
			if self.mergeable == Some(false) { 1 } else { 0 },
			if self.is_approved() { 0 } else { 1 },
			if self.rollup { 1 } else { 0 },
			-self.priority,
			self.number,
		)
	}

	/// The status the dispatcher should report back to the hosting
	/// platform, folding the per-builder `build_res` map down to a single
	/// success/pending/failure verdict.
	pub fn effective_status(&self) -> Status {
		if self.build_res.is_empty() {
			return self.status;
		}
		if self.build_res.values().all(|r| r.succeeded == Some(true)) {
			Status::Success
		} else if self.build_res.values().any(|r| r.succeeded == Some(false)) {
			Status::Failure
		} else {
			Status::Pending
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pr(status: Status, approved: bool, rollup: bool, priority: i32, number: i64) -> PullRequest {
		let mut pr = PullRequest::new("acme".into(), "widgets".into(), number, "head0000".into());
		pr.status = status;
		pr.rollup = rollup;
		pr.priority = priority;
		if approved {
			pr.approval = Some(Approval {
				approved_by: "reviewer".into(),
				approved_sha: "head0000".into(),
			});
		}
		pr
	}

	#[test]
	fn ordering_matches_the_literal_scenario() {
		let mut prs = vec![
			pr(Status::Pending, true, false, 0, 10),
			pr(Status::Empty, true, false, 0, 20),
			pr(Status::Empty, true, true, 0, 15),
			pr(Status::Empty, false, false, 5, 30),
		];
		prs.sort_by_key(|p| p.sort_key());
		let numbers: Vec<i64> = prs.iter().map(|p| p.number).collect();
		assert_eq!(numbers, vec![10, 20, 15, 30]);
	}
}
