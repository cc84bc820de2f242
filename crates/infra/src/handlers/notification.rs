//! Outbound user notifications.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use labflow_core::{ScopeRef, UserId};

use crate::datastore::NotificationDelivery;
use crate::jobs::{HandlerRegistration, JobContext, JobError, QueueClass, RetryPolicy, TypedJob};
use crate::notifier::{Channel, OutgoingNotification};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendNotificationArgs {
    /// Deduplication key; a notification id is delivered at most once.
    pub notification_id: String,
    pub user_id: UserId,
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// Delivers one notification through the configured gateway.
///
/// Gateway outages retry with backoff, rate limits retry after the
/// gateway's hint, and a rejected recipient dead-letters immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendNotification;

#[async_trait]
impl TypedJob for SendNotification {
    const NAME: &'static str = "send_notification";
    type Args = SendNotificationArgs;

    fn registration(&self) -> HandlerRegistration {
        HandlerRegistration::new(Self::NAME)
            .queue(QueueClass::Default)
            .retry_policy(
                RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(300))
                    .with_jitter(Duration::from_millis(250)),
            )
            .timeout(Duration::from_secs(30))
    }

    async fn run(&self, args: SendNotificationArgs, ctx: &JobContext) -> Result<(), JobError> {
        if args.subject.trim().is_empty() {
            return Err(JobError::validation("notification subject is empty"));
        }
        if ctx.data().notification_delivered(&args.notification_id).await? {
            tracing::debug!(notification_id = %args.notification_id, "notification already delivered");
            return Ok(());
        }

        let outgoing = OutgoingNotification {
            notification_id: args.notification_id.clone(),
            user_id: args.user_id,
            channel: args.channel,
            recipient: args.recipient,
            subject: args.subject,
            body: args.body,
        };
        let receipt = ctx.notifier().send(&outgoing).await?;

        let recorded = ctx
            .data()
            .record_notification(NotificationDelivery {
                notification_id: args.notification_id.clone(),
                user_id: args.user_id,
                delivered_at: receipt.accepted_at,
            })
            .await?;
        if !recorded {
            // A concurrent attempt finished first and already announced it.
            return Ok(());
        }

        ctx.events().emit(
            ScopeRef::user(args.user_id),
            "notification.delivered",
            json!({
                "notification_id": args.notification_id,
                "channel": args.channel,
                "provider_id": receipt.provider_id,
                "delivered_at": Utc::now(),
            }),
        );
        Ok(())
    }
}
