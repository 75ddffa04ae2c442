use crate::constants::{DB_POOL_MAX_ATTEMPTS, DB_POOL_RETRY_DELAY_MS};
use crate::entity::{Approval, BuildResult, PullRequest, Status};
use crate::error::{self, Error};
use crate::types::Result;
use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Acquire, Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// Relational persistence over an embedded SQLite database. Every public
/// method here is one transaction: a connection is checked out, the write
/// is made, and the transaction is committed before the method returns,
/// mirroring the "one connection in, commit, connection back to the pool"
/// discipline the original's database layer enforces around every query.
pub struct Store {
	pool: SqlitePool,
}

impl Store {
	pub async fn connect(path: &str) -> Result<Self> {
		let options = SqliteConnectOptions::from_str(path)
			.context(error::Db)?
			.create_if_missing(true)
			.foreign_keys(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(10)
			.connect_with(options)
			.await
			.context(error::Db)?;
		let store = Self { pool };
		store.run_migrations().await?;
		Ok(store)
	}

	pub async fn in_memory() -> Result<Self> {
		let pool = SqlitePoolOptions::new()
			.max_connections(5)
			.connect("sqlite::memory:")
			.await
			.context(error::Db)?;
		let store = Self { pool };
		store.run_migrations().await?;
		Ok(store)
	}

	async fn run_migrations(&self) -> Result<()> {
		sqlx::query(include_str!("../../migrations/0001_init.sql"))
			.execute(&self.pool)
			.await
			.context(error::Db)?;
		Ok(())
	}

	/// Checks out a connection from the pool, retrying on exhaustion up to
	/// `DB_POOL_MAX_ATTEMPTS` times with a fixed delay between attempts.
	/// Grounded in the original's connection pool, which recurses up to 20
	/// times with a 0.2 second sleep before giving up.
	async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
		let mut attempt = 0;
		loop {
			match self.pool.acquire().await {
				Ok(conn) => return Ok(conn),
				Err(err) => {
					attempt += 1;
					if attempt >= DB_POOL_MAX_ATTEMPTS {
						return Err(Error::Db { source: err });
					}
					tokio::time::sleep(Duration::from_millis(DB_POOL_RETRY_DELAY_MS)).await;
				}
			}
		}
	}

	pub async fn upsert_pull(&self, pr: &PullRequest) -> Result<()> {
		let mut conn = self.acquire().await?;
		let mut tx = conn.begin().await.context(error::Db)?;

		let status = status_to_str(pr.status);
		sqlx::query(
			"INSERT INTO pull (owner, repo, number, head_sha, head_ref, base_ref, title, body, status, \
			 approved_by, approved_sha, priority, try_, rollup, merge_sha) \
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
			 ON CONFLICT (owner, repo, number) DO UPDATE SET \
			 head_sha = excluded.head_sha, head_ref = excluded.head_ref, base_ref = excluded.base_ref, \
			 title = excluded.title, body = excluded.body, \
			 status = excluded.status, approved_by = excluded.approved_by, \
			 approved_sha = excluded.approved_sha, priority = excluded.priority, \
			 try_ = excluded.try_, rollup = excluded.rollup, merge_sha = excluded.merge_sha",
		)
		.bind(&pr.owner)
		.bind(&pr.repo)
		.bind(pr.number)
		.bind(&pr.head_sha)
		.bind(&pr.head_ref)
		.bind(&pr.base_ref)
		.bind(&pr.title)
		.bind(&pr.body)
		.bind(status)
		.bind(pr.approval.as_ref().map(|a| a.approved_by.as_str()))
		.bind(pr.approval.as_ref().map(|a| a.approved_sha.as_str()))
		.bind(pr.priority)
		.bind(pr.try_ as i32)
		.bind(pr.rollup as i32)
		.bind(if pr.try_ { None } else { pr.merge_sha.as_deref() })
		.execute(&mut tx)
		.await
		.context(error::Db)?;

		// The entity's `build_res` map is the source of truth for this PR's
		// current attempt; replace the table's rows to match rather than
		// leaving earlier mutations (a fresh build's cleared map, a rebuild's
		// per-builder updates, a commit-status update) unpersisted.
		sqlx::query("DELETE FROM build_res WHERE owner = ? AND repo = ? AND number = ?")
			.bind(&pr.owner)
			.bind(&pr.repo)
			.bind(pr.number)
			.execute(&mut tx)
			.await
			.context(error::Db)?;
		for (builder, result) in &pr.build_res {
			sqlx::query(
				"INSERT INTO build_res (owner, repo, number, builder, url, succeeded, merge_sha) \
				 VALUES (?, ?, ?, ?, ?, ?, ?)",
			)
			.bind(&pr.owner)
			.bind(&pr.repo)
			.bind(pr.number)
			.bind(builder)
			.bind(&result.url)
			.bind(result.succeeded)
			.bind(&result.merge_sha)
			.execute(&mut tx)
			.await
			.context(error::Db)?;
		}

		tx.commit().await.context(error::Db)?;
		Ok(())
	}

	pub async fn set_mergeable(
		&self,
		owner: &str,
		repo: &str,
		number: i64,
		mergeable: Option<bool>,
	) -> Result<()> {
		let mut conn = self.acquire().await?;
		let mut tx = conn.begin().await.context(error::Db)?;
		sqlx::query(
			"INSERT INTO mergeable (owner, repo, number, mergeable) VALUES (?, ?, ?, ?) \
			 ON CONFLICT (owner, repo, number) DO UPDATE SET mergeable = excluded.mergeable",
		)
		.bind(owner)
		.bind(repo)
		.bind(number)
		.bind(mergeable)
		.execute(&mut tx)
		.await
		.context(error::Db)?;
		tx.commit().await.context(error::Db)?;
		Ok(())
	}

	/// Purges all rows for a repository, used by the synchronizer at the
	/// start of its bootstrap pass before it replays the platform's
	/// current state back in.
	pub async fn purge_repo(&self, owner: &str, repo: &str) -> Result<()> {
		let mut conn = self.acquire().await?;
		let mut tx = conn.begin().await.context(error::Db)?;
		sqlx::query("DELETE FROM mergeable WHERE owner = ? AND repo = ?")
			.bind(owner)
			.bind(repo)
			.execute(&mut tx)
			.await
			.context(error::Db)?;
		sqlx::query("DELETE FROM build_res WHERE owner = ? AND repo = ?")
			.bind(owner)
			.bind(repo)
			.execute(&mut tx)
			.await
			.context(error::Db)?;
		sqlx::query("DELETE FROM pull WHERE owner = ? AND repo = ?")
			.bind(owner)
			.bind(repo)
			.execute(&mut tx)
			.await
			.context(error::Db)?;
		tx.commit().await.context(error::Db)?;
		Ok(())
	}

	pub async fn get_pull(&self, owner: &str, repo: &str, number: i64) -> Result<Option<PullRequest>> {
		let mut conn = self.acquire().await?;
		let row = sqlx::query(
			"SELECT * FROM pull WHERE owner = ? AND repo = ? AND number = ?",
		)
		.bind(owner)
		.bind(repo)
		.bind(number)
		.fetch_optional(&mut conn)
		.await
		.context(error::Db)?;

		let row = match row {
			Some(row) => row,
			None => return Ok(None),
		};
		Ok(Some(self.hydrate(&mut conn, row).await?))
	}

	/// Loads every PR tracked for a repository, with their build results
	/// and mergeability folded in. Used by the queue processor's scan.
	pub async fn list_repo(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>> {
		let mut conn = self.acquire().await?;
		let rows = sqlx::query("SELECT * FROM pull WHERE owner = ? AND repo = ?")
			.bind(owner)
			.bind(repo)
			.fetch_all(&mut conn)
			.await
			.context(error::Db)?;

		let mut out = Vec::with_capacity(rows.len());
		for row in rows {
			out.push(self.hydrate(&mut conn, row).await?);
		}
		Ok(out)
	}

	async fn hydrate(
		&self,
		conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
		row: sqlx::sqlite::SqliteRow,
	) -> Result<PullRequest> {
		let mut pr = PullRequest::new(
			row.try_get("owner").context(error::Db)?,
			row.try_get("repo").context(error::Db)?,
			row.try_get("number").context(error::Db)?,
			row.try_get("head_sha").context(error::Db)?,
		);
		pr.head_ref = row.try_get("head_ref").context(error::Db)?;
		pr.base_ref = row.try_get("base_ref").context(error::Db)?;
		pr.title = row.try_get("title").context(error::Db)?;
		pr.body = row.try_get("body").context(error::Db)?;
		pr.status = status_from_str(&row.try_get::<String, _>("status").context(error::Db)?);
		let approved_by: Option<String> = row.try_get("approved_by").context(error::Db)?;
		let approved_sha: Option<String> = row.try_get("approved_sha").context(error::Db)?;
		pr.approval = match (approved_by, approved_sha) {
			(Some(approved_by), Some(approved_sha)) => Some(Approval {
				approved_by,
				approved_sha,
			}),
			_ => None,
		};
		pr.priority = row.try_get("priority").context(error::Db)?;
		pr.try_ = row.try_get::<i32, _>("try_").context(error::Db)? != 0;
		pr.rollup = row.try_get::<i32, _>("rollup").context(error::Db)? != 0;
		pr.merge_sha = row.try_get("merge_sha").context(error::Db)?;

		if pr.status == Status::Pending && pr.merge_sha.is_none() {
			pr.status = Status::Empty;
		}

		let build_rows = sqlx::query(
			"SELECT builder, url, succeeded, merge_sha FROM build_res \
			 WHERE owner = ? AND repo = ? AND number = ?",
		)
		.bind(&pr.owner)
		.bind(&pr.repo)
		.bind(pr.number)
		.fetch_all(&mut *conn)
		.await
		.context(error::Db)?;
		for build_row in build_rows {
			let builder: String = build_row.try_get("builder").context(error::Db)?;
			let result = BuildResult {
				url: build_row.try_get("url").context(error::Db)?,
				succeeded: build_row.try_get("succeeded").context(error::Db)?,
				merge_sha: build_row.try_get("merge_sha").context(error::Db)?,
			};
			// A row whose merge SHA no longer matches the owning PR's
			// current attempt is stale (left over from an earlier build)
			// and is dropped rather than folded in.
			if result.merge_sha.is_some() && result.merge_sha != pr.merge_sha {
				continue;
			}
			pr.build_res.insert(builder, result);
		}

		let mergeable_row = sqlx::query(
			"SELECT mergeable FROM mergeable WHERE owner = ? AND repo = ? AND number = ?",
		)
		.bind(&pr.owner)
		.bind(&pr.repo)
		.bind(pr.number)
		.fetch_optional(&mut *conn)
		.await
		.context(error::Db)?;
		if let Some(mergeable_row) = mergeable_row {
			pr.mergeable = mergeable_row.try_get("mergeable").context(error::Db)?;
		}

		Ok(pr)
	}
}

fn status_to_str(status: Status) -> &'static str {
	match status {
		Status::Empty => "empty",
		Status::Pending => "pending",
		Status::Success => "success",
		Status::Failure => "failure",
		Status::Error => "error",
	}
}

fn status_from_str(s: &str) -> Status {
	match s {
		"pending" => Status::Pending,
		"success" => Status::Success,
		"failure" => Status::Failure,
		"error" => Status::Error,
		_ => Status::Empty,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::entity::PullRequest;

	#[tokio::test]
	async fn upsert_and_load_round_trips() {
		let store = Store::in_memory().await.unwrap();
		let mut pr = PullRequest::new("o".into(), "r".into(), 1, "abc1234".into());
		pr.priority = 5;
		store.upsert_pull(&pr).await.unwrap();

		let loaded = store.get_pull("o", "r", 1).await.unwrap().unwrap();
		assert_eq!(loaded.priority, 5);
		assert_eq!(loaded.head_sha, "abc1234");
	}

	#[tokio::test]
	async fn recovery_demotes_pending_without_merge_sha() {
		let store = Store::in_memory().await.unwrap();
		sqlx::query(
			"INSERT INTO pull (owner, repo, number, head_sha, head_ref, base_ref, title, body, \
			 status, approved_by, approved_sha, priority, try_, rollup, merge_sha) \
			 VALUES ('o', 'r', 9, 'feedcafe', '', '', '', '', 'pending', NULL, NULL, 0, 0, 0, NULL)",
		)
		.execute(&store.pool)
		.await
		.unwrap();

		let loaded = store.get_pull("o", "r", 9).await.unwrap().unwrap();
		assert_eq!(loaded.status, Status::Empty);
	}

	#[tokio::test]
	async fn stale_build_res_row_is_dropped_on_hydrate() {
		let store = Store::in_memory().await.unwrap();
		let mut pr = PullRequest::new("o".into(), "r".into(), 11, "abc1234".into());
		pr.merge_sha = Some("merge-current".into());
		store.upsert_pull(&pr).await.unwrap();

		sqlx::query(
			"INSERT INTO build_res (owner, repo, number, builder, url, succeeded, merge_sha) \
			 VALUES ('o', 'r', 11, 'stale-builder', NULL, NULL, 'merge-old')",
		)
		.execute(&store.pool)
		.await
		.unwrap();

		let loaded = store.get_pull("o", "r", 11).await.unwrap().unwrap();
		assert!(!loaded.build_res.contains_key("stale-builder"));
	}

	#[tokio::test]
	async fn purge_repo_clears_all_tables() {
		let store = Store::in_memory().await.unwrap();
		let pr = PullRequest::new("o".into(), "r".into(), 1, "abc1234".into());
		store.upsert_pull(&pr).await.unwrap();
		store.set_mergeable("o", "r", 1, Some(true)).await.unwrap();

		store.purge_repo("o", "r").await.unwrap();
		assert!(store.get_pull("o", "r", 1).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn connect_runs_migrations_against_a_file_backed_database() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("queue.db");
		let store = Store::connect(path.to_str().unwrap()).await.unwrap();

		let pr = PullRequest::new("o".into(), "r".into(), 7, "deadbee".into());
		store.upsert_pull(&pr).await.unwrap();
		assert!(store.get_pull("o", "r", 7).await.unwrap().is_some());
	}
}
