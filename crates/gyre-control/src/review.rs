use crate::{ControlError, ControlResult, ReviewDecision, RunReviewRecord, Services};
use std::sync::Arc;

pub const WRITEBACK_PENDING: &str = "PENDING";
pub const WRITEBACK_COMPLETED: &str = "COMPLETED";
pub const WRITEBACK_FAILED: &str = "FAILED";
pub const WRITEBACK_SKIPPED: &str = "SKIPPED";

const CHECK_RUN_NAME: &str = "attractor-review";

/// Stores run reviews and surfaces the evidence back to the source-control
/// host as a check run plus a pull-request comment.
pub struct ReviewService {
    services: Arc<Services>,
}

impl ReviewService {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Upsert the review row, then attempt the writeback. The writeback is
    /// retried at most once; the final status lands on the review row.
    pub async fn submit(&self, mut review: RunReviewRecord) -> ControlResult<RunReviewRecord> {
        let services = &self.services;
        let run = services.store.get_run(&review.run_id).await?;

        review.writeback_status = WRITEBACK_PENDING.to_string();
        services.store.upsert_review(review.clone()).await?;

        let Some(pr_ref) = run.linked_pull_request_ref.as_deref() else {
            review.writeback_status = WRITEBACK_SKIPPED.to_string();
            return services.store.upsert_review(review).await;
        };
        let (owner, repo, pr_number) = parse_pull_request_ref(pr_ref)?;
        let head_sha = review
            .reviewed_head_sha
            .clone()
            .unwrap_or_default();

        let mut status = WRITEBACK_FAILED;
        for _ in 0..2 {
            if self
                .write_back(&review, &owner, &repo, pr_number, &head_sha)
                .await
                .is_ok()
            {
                status = WRITEBACK_COMPLETED;
                break;
            }
        }

        review.writeback_status = status.to_string();
        services.store.upsert_review(review).await
    }

    async fn write_back(
        &self,
        review: &RunReviewRecord,
        owner: &str,
        repo: &str,
        pr_number: u64,
        head_sha: &str,
    ) -> ControlResult<()> {
        let host = &self.services.host;
        let conclusion = match review.decision {
            ReviewDecision::Approve => "success",
            ReviewDecision::RequestChanges | ReviewDecision::Reject => "failure",
            ReviewDecision::Exception => "neutral",
        };
        let summary = review.summary.clone().unwrap_or_default();

        host.post_check_run(owner, repo, head_sha, CHECK_RUN_NAME, conclusion, &summary)
            .await
            .map_err(|error| ControlError::Transient(error.to_string()))?;
        host.post_issue_comment(owner, repo, pr_number, &comment_body(review))
            .await
            .map_err(|error| ControlError::Transient(error.to_string()))?;
        Ok(())
    }
}

fn comment_body(review: &RunReviewRecord) -> String {
    let mut body = format!(
        "### Review by {}\n\nDecision: **{:?}**\n",
        review.reviewer, review.decision
    );
    if let Some(summary) = review.summary.as_deref() {
        body.push_str("\n");
        body.push_str(summary);
        body.push('\n');
    }
    body
}

fn parse_pull_request_ref(pr_ref: &str) -> ControlResult<(String, String, u64)> {
    let (repo_full, number) = pr_ref.split_once('#').ok_or_else(|| {
        ControlError::Validation(format!("pull request ref '{pr_ref}' is not owner/repo#N"))
    })?;
    let (owner, repo) = repo_full.split_once('/').ok_or_else(|| {
        ControlError::Validation(format!("pull request ref '{pr_ref}' is not owner/repo#N"))
    })?;
    let number = number.parse::<u64>().map_err(|_| {
        ControlError::Validation(format!("pull request ref '{pr_ref}' has no number"))
    })?;
    Ok((owner.to_string(), repo.to_string(), number))
}
