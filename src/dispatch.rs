use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::compose;
use crate::error::NotifyError;
use crate::models::{FieldMapping, FreeTextParams, MappedRow, Mode, SendResult, SendStatus};
use crate::provider::{MessageSender, OutboundMessage};

pub const SENT_MESSAGE: &str = "Sent successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub attempted: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.attempted as f64 / self.total as f64
        }
    }
}

/// Extension points around each delivery. Both default to no-ops.
#[async_trait]
pub trait DispatchHooks: Send {
    /// Awaited before row `index` is sent.
    async fn before_send(&mut self, _index: usize) {}

    /// Called once the row's outcome is recorded.
    fn after_send(&mut self, _progress: Progress, _result: &SendResult) {}
}

/// Fixed pause between consecutive rows plus a progress callback.
pub struct Paced<F> {
    delay: Duration,
    on_progress: F,
}

impl<F> Paced<F>
where
    F: FnMut(Progress, &SendResult) + Send,
{
    pub fn new(delay: Duration, on_progress: F) -> Self {
        Self { delay, on_progress }
    }
}

#[async_trait]
impl<F> DispatchHooks for Paced<F>
where
    F: FnMut(Progress, &SendResult) + Send,
{
    async fn before_send(&mut self, index: usize) {
        if index > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn after_send(&mut self, progress: Progress, result: &SendResult) {
        (self.on_progress)(progress, result);
    }
}

/// Everything a run needs besides the rows.
#[derive(Debug, Clone, Copy)]
pub struct DispatchJob<'a> {
    pub run_id: Uuid,
    pub mode: Mode,
    pub template_name: &'a str,
    pub mapping: &'a FieldMapping,
    pub params: &'a FreeTextParams,
}

/// Sends one message per row, strictly one at a time and in order.
///
/// A row failure is recorded and the loop moves on, so the result always has
/// one entry per row. Only a missing template name refuses the whole run.
pub async fn dispatch<S, H>(
    sender: &S,
    rows: &[MappedRow<'_>],
    job: &DispatchJob<'_>,
    hooks: &mut H,
) -> Result<Vec<SendResult>, NotifyError>
where
    S: MessageSender + ?Sized,
    H: DispatchHooks + ?Sized,
{
    if job.template_name.trim().is_empty() {
        return Err(NotifyError::MissingTemplateConfiguration {
            mode: job.mode.to_string(),
        });
    }

    tracing::info!(
        run_id = %job.run_id,
        mode = %job.mode,
        template = job.template_name,
        rows = rows.len(),
        "dispatch started"
    );

    let total = rows.len();
    let mut results = Vec::with_capacity(total);
    for (index, row) in rows.iter().enumerate() {
        hooks.before_send(index).await;

        let parameters = compose::compose(row.record, job.mapping, job.mode, job.params);
        let message = OutboundMessage {
            recipient: &row.phone_number,
            template_name: job.template_name,
            parameters: &parameters,
        };

        let result = match sender.send_templated_message(&message).await {
            Ok(()) => {
                tracing::debug!(run_id = %job.run_id, row = index + 1, student = %row.student_name, "sent");
                SendResult {
                    student_name: row.student_name.clone(),
                    status: SendStatus::Success,
                    message: SENT_MESSAGE.to_string(),
                }
            }
            Err(err) => {
                tracing::warn!(
                    run_id = %job.run_id,
                    row = index + 1,
                    student = %row.student_name,
                    error = %err,
                    "send failed"
                );
                SendResult {
                    student_name: row.student_name.clone(),
                    status: SendStatus::Failed,
                    message: err.to_string(),
                }
            }
        };

        let progress = Progress {
            attempted: index + 1,
            total,
        };
        hooks.after_send(progress, &result);
        results.push(result);
    }

    let failed = results
        .iter()
        .filter(|result| result.status == SendStatus::Failed)
        .count();
    tracing::info!(
        run_id = %job.run_id,
        sent = total - failed,
        failed,
        "dispatch finished"
    );

    Ok(results)
}
