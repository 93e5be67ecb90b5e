//! Delivery dispatcher: one pending attempt per channel of a rendered sheet,
//! each tried by its own `deliver` job with exponential backoff.

use std::{collections::BTreeSet, sync::Arc};

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        database::Tx,
        deliveries::{self, AttemptKey},
        games,
        models::{AttemptState, DeliveryChannel, SheetState, TurnSheetEntity},
        rls::RlsScope,
        turn_sheets::{self, SheetPatch, SheetStoreError},
    },
    error::PipelineError,
    services::{
        jobs::{self, Job, JobOutcome, RetryPolicy},
        orchestrator,
    },
    state::{SharedState, lifecycle::is_terminal},
    transport::{DeliveryEnvelope, Recipient, TransportError},
};

/// Move a rendered sheet to `dispatched`, queueing attempt 1 of every
/// channel of its subscription. Returns `false` when the sheet was already
/// past `rendered`.
pub async fn dispatch(
    state: &SharedState,
    scope: RlsScope,
    game_id: Uuid,
    sheet_id: Uuid,
) -> Result<bool, PipelineError> {
    let now = state.now();
    state
        .db()
        .transaction(move |tx| {
            let sheet = turn_sheets::get_sheet(tx, &scope, sheet_id)?;
            if sheet.state != SheetState::Rendered {
                debug!(%sheet_id, state = %sheet.state, "sheet already dispatched");
                return Ok(false);
            }
            let subscription = games::get_subscription(tx, sheet.game_subscription_id)?
                .ok_or_else(|| {
                    PipelineError::NotFound(format!("subscription {}", sheet.game_subscription_id))
                })?;
            let channels: BTreeSet<DeliveryChannel> =
                subscription.delivery_channels.iter().copied().collect();
            if channels.is_empty() {
                orchestrator::fail_sheet(tx, &scope, &sheet, "subscription has no delivery channel", now)?;
                return Ok(false);
            }

            for channel in &channels {
                let key = AttemptKey {
                    turn_sheet_id: sheet_id,
                    channel: *channel,
                    attempt_number: 1,
                };
                deliveries::insert_attempt(tx, key, now)?;
                jobs::enqueue(tx, &deliver_job(game_id, &sheet, key), now, now)?;
            }
            turn_sheets::transition(
                tx,
                &scope,
                sheet_id,
                SheetState::Rendered,
                SheetState::Dispatched,
                SheetPatch::default(),
                now,
            )?;
            info!(%sheet_id, code = %sheet.code, channels = channels.len(), "dispatched turn sheet");
            orchestrator::advance_if_all_dispatched(
                tx,
                &scope,
                sheet.game_instance_id,
                sheet.turn_number,
                now,
            )?;
            Ok::<_, PipelineError>(true)
        })
        .await
}

fn deliver_job(game_id: Uuid, sheet: &TurnSheetEntity, key: AttemptKey) -> Job {
    Job::Deliver {
        game_id,
        instance_id: sheet.game_instance_id,
        sheet_id: key.turn_sheet_id,
        channel: key.channel,
        attempt_number: key.attempt_number,
    }
}

/// `deliver` job: try one channel once and record the outcome.
///
/// The transport is called outside any transaction; only the outcome is
/// written back, as a compare-and-swap on the pending attempt.
pub async fn deliver(
    state: &SharedState,
    game_id: Uuid,
    key: AttemptKey,
) -> Result<JobOutcome, PipelineError> {
    let scope = RlsScope::for_game(game_id);
    let (sheet, attempt, account, game) = {
        let scope = scope.clone();
        state
            .db()
            .read(move |tx| {
                let sheet = turn_sheets::get_sheet(tx, &scope, key.turn_sheet_id)?;
                let attempt = deliveries::get_attempt(tx, key)?;
                let account = games::get_account(tx, sheet.account_id)?;
                let game = games::get_game(tx, game_id)?;
                Ok::<_, PipelineError>((sheet, attempt, account, game))
            })
            .await?
    };
    let attempt = attempt.ok_or_else(|| {
        PipelineError::NotFound(format!(
            "attempt {} of {} for sheet {}",
            key.attempt_number, key.channel, key.turn_sheet_id
        ))
    })?;
    if attempt.state != AttemptState::Pending {
        debug!(sheet_id = %key.turn_sheet_id, channel = %key.channel, attempt = key.attempt_number, state = %attempt.state, "attempt already settled");
        return Ok(JobOutcome::Done);
    }
    let now = state.now();
    if is_terminal(sheet.state) {
        let reason = format!("sheet is {}", sheet.state);
        state
            .db()
            .transaction(move |tx| {
                deliveries::set_attempt_state(
                    tx,
                    key,
                    AttemptState::Pending,
                    AttemptState::Abandoned,
                    Some(&reason),
                    now,
                )
            })
            .await?;
        return Ok(JobOutcome::Done);
    }
    let account = account
        .ok_or_else(|| PipelineError::NotFound(format!("account {}", sheet.account_id)))?;
    let game = game.ok_or_else(|| PipelineError::NotFound(format!("game {game_id}")))?;

    let Some(transport) = state.transports().get(key.channel) else {
        let reason = format!("no transport configured for {}", key.channel);
        state
            .db()
            .transaction(move |tx| abandon_channel(tx, &scope, key, &reason, now))
            .await?;
        return Ok(JobOutcome::Done);
    };

    let generator = state
        .registry()
        .lookup(game.game_type, sheet.sheet_type)?
        .generator
        .clone();
    let rendered = generator.generate(&sheet.template_data)?;
    if sheet.rendered_digest.as_deref() != Some(rendered.digest.as_str()) {
        warn!(
            sheet_id = %sheet.id,
            recorded = ?sheet.rendered_digest,
            rendered = %rendered.digest,
            "re-rendered artifact differs from the recorded digest"
        );
    }
    let envelope = Arc::new(DeliveryEnvelope {
        turn_sheet_id: sheet.id,
        game_instance_id: sheet.game_instance_id,
        turn_number: sheet.turn_number,
        channel: key.channel,
        attempt_number: key.attempt_number,
        code: sheet.code.clone(),
        recipient: Recipient {
            account_id: account.id,
            name: account.name,
            email: account.email,
            postal_address: account.postal_address,
        },
        artifact: Arc::from(rendered.bytes),
        content_type: rendered.content_type,
        digest: rendered.digest,
    });

    let result = transport.deliver(envelope).await;
    let now = state.now();
    let policy = RetryPolicy::new(
        state.config().delivery_backoff_base(),
        state.config().delivery_retry_budget,
    );
    let queued_retry = state
        .db()
        .transaction(move |tx| record_outcome(tx, &scope, game_id, &sheet, key, result, policy, now))
        .await?;
    if queued_retry {
        state.notify_queue();
    }
    Ok(JobOutcome::Done)
}

/// Write the outcome of one try. Returns whether another try was queued.
#[allow(clippy::too_many_arguments)]
fn record_outcome(
    tx: &Tx<'_>,
    scope: &RlsScope,
    game_id: Uuid,
    sheet: &TurnSheetEntity,
    key: AttemptKey,
    result: Result<(), TransportError>,
    policy: RetryPolicy,
    now: OffsetDateTime,
) -> Result<bool, PipelineError> {
    let err = match result {
        Ok(()) => {
            if !deliveries::set_attempt_state(
                tx,
                key,
                AttemptState::Pending,
                AttemptState::Succeeded,
                None,
                now,
            )? {
                debug!(sheet_id = %key.turn_sheet_id, channel = %key.channel, "attempt settled concurrently");
                return Ok(false);
            }
            info!(
                sheet_id = %key.turn_sheet_id,
                channel = %key.channel,
                attempt = key.attempt_number,
                "delivered turn sheet"
            );
            match turn_sheets::transition(
                tx,
                scope,
                key.turn_sheet_id,
                SheetState::Dispatched,
                SheetState::Delivered,
                SheetPatch::default(),
                now,
            ) {
                Ok(_) | Err(SheetStoreError::StaleState { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(false);
        }
        Err(err) => err,
    };

    let message = err.to_string();
    let permanent = matches!(err, TransportError::MissingAddress(_));
    if permanent || !policy.allows_another(key.attempt_number) {
        abandon_channel(tx, scope, key, &message, now)?;
        return Ok(false);
    }

    if !deliveries::set_attempt_state(
        tx,
        key,
        AttemptState::Pending,
        AttemptState::Failed,
        Some(&message),
        now,
    )? {
        return Ok(false);
    }
    let next = AttemptKey {
        attempt_number: key.attempt_number + 1,
        ..key
    };
    let run_after = now + policy.jittered_backoff(key.attempt_number);
    deliveries::insert_attempt(tx, next, now)?;
    jobs::enqueue(tx, &deliver_job(game_id, sheet, next), run_after, now)?;
    warn!(
        sheet_id = %key.turn_sheet_id,
        channel = %key.channel,
        attempt = key.attempt_number,
        error = %message,
        retry_at = %run_after,
        "delivery failed; retrying"
    );
    Ok(true)
}

/// Abandon the pending attempt of a channel. Once every channel of the
/// sheet is abandoned without any success, the sheet fails.
fn abandon_channel(
    tx: &Tx<'_>,
    scope: &RlsScope,
    key: AttemptKey,
    reason: &str,
    now: OffsetDateTime,
) -> Result<(), PipelineError> {
    deliveries::set_attempt_state(
        tx,
        key,
        AttemptState::Pending,
        AttemptState::Abandoned,
        Some(reason),
        now,
    )?;
    warn!(
        sheet_id = %key.turn_sheet_id,
        channel = %key.channel,
        attempt = key.attempt_number,
        reason,
        "delivery channel abandoned"
    );

    let attempts = deliveries::list_attempts(tx, key.turn_sheet_id)?;
    let channels: BTreeSet<_> = attempts.iter().map(|attempt| attempt.channel).collect();
    let abandoned: BTreeSet<_> = attempts
        .iter()
        .filter(|attempt| attempt.state == AttemptState::Abandoned)
        .map(|attempt| attempt.channel)
        .collect();
    let succeeded = attempts
        .iter()
        .any(|attempt| attempt.state == AttemptState::Succeeded);
    if succeeded || channels != abandoned {
        return Ok(());
    }

    let sheet = turn_sheets::get_sheet(tx, scope, key.turn_sheet_id)?;
    if sheet.state == SheetState::Dispatched {
        orchestrator::fail_sheet(tx, scope, &sheet, "every delivery channel was abandoned", now)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::dao::{
        fixtures::{NOW, mint, seed, sheet, with_tx},
        models::SheetType,
    };

    fn dispatched(tx: &Tx<'_>) -> (RlsScope, TurnSheetEntity) {
        let fixture = seed(tx);
        let scope = RlsScope::for_game(fixture.game_id);
        let mut record = sheet(&fixture, SheetType::LocationChoice, mint());
        record.state = SheetState::Dispatched;
        turn_sheets::insert_sheet(tx, &scope, &record).unwrap();
        (scope, record)
    }

    fn key(sheet: &TurnSheetEntity, channel: DeliveryChannel, attempt_number: u32) -> AttemptKey {
        AttemptKey {
            turn_sheet_id: sheet.id,
            channel,
            attempt_number,
        }
    }

    #[tokio::test]
    async fn failed_try_queues_the_next_attempt() {
        with_tx(|tx| {
            let (scope, record) = dispatched(tx);
            let first = key(&record, DeliveryChannel::Email, 1);
            deliveries::insert_attempt(tx, first, NOW).unwrap();
            let policy = RetryPolicy::new(StdDuration::from_secs(30), 3);

            let queued = record_outcome(
                tx,
                &scope,
                Uuid::new_v4(),
                &record,
                first,
                Err(TransportError::Rejected(500)),
                policy,
                NOW,
            )
            .unwrap();

            assert!(queued);
            let attempts = deliveries::list_attempts(tx, record.id).unwrap();
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].state, AttemptState::Failed);
            assert_eq!(attempts[1].state, AttemptState::Pending);
            assert_eq!(attempts[1].attempt_number, 2);
        })
        .await;
    }

    #[tokio::test]
    async fn last_channel_abandoned_fails_the_sheet() {
        with_tx(|tx| {
            let (scope, record) = dispatched(tx);
            let last = key(&record, DeliveryChannel::Email, 3);
            deliveries::insert_attempt(tx, last, NOW).unwrap();
            let policy = RetryPolicy::new(StdDuration::from_secs(30), 3);

            let queued = record_outcome(
                tx,
                &scope,
                Uuid::new_v4(),
                &record,
                last,
                Err(TransportError::Rejected(503)),
                policy,
                NOW,
            )
            .unwrap();

            assert!(!queued);
            let attempt = deliveries::get_attempt(tx, last).unwrap().unwrap();
            assert_eq!(attempt.state, AttemptState::Abandoned);
            let sheet = turn_sheets::get_sheet(tx, &scope, record.id).unwrap();
            assert_eq!(sheet.state, SheetState::Failed);
        })
        .await;
    }

    #[tokio::test]
    async fn missing_address_abandons_without_retry_but_other_channel_keeps_sheet() {
        with_tx(|tx| {
            let (scope, record) = dispatched(tx);
            let email = key(&record, DeliveryChannel::Email, 1);
            let post = key(&record, DeliveryChannel::PhysicalPost, 1);
            deliveries::insert_attempt(tx, email, NOW).unwrap();
            deliveries::insert_attempt(tx, post, NOW).unwrap();
            let policy = RetryPolicy::new(StdDuration::from_secs(30), 3);

            record_outcome(
                tx,
                &scope,
                Uuid::new_v4(),
                &record,
                email,
                Err(TransportError::MissingAddress("email address")),
                policy,
                NOW,
            )
            .unwrap();

            let attempts = deliveries::list_attempts(tx, record.id).unwrap();
            assert_eq!(attempts.len(), 2);
            let sheet = turn_sheets::get_sheet(tx, &scope, record.id).unwrap();
            assert_eq!(sheet.state, SheetState::Dispatched);

            record_outcome(tx, &scope, Uuid::new_v4(), &record, post, Ok(()), policy, NOW).unwrap();
            let sheet = turn_sheets::get_sheet(tx, &scope, record.id).unwrap();
            assert_eq!(sheet.state, SheetState::Delivered);
        })
        .await;
    }
}
