//! Turn orchestrator: the per-instance state machine opening turns, emitting
//! their sheets and resolving them once quorum or the deadline is reached.
//!
//! Every step runs as a job inside one store transaction; the instance row
//! (`current_turn_number`, `turn_phase`) and the sheet rows carry all durable
//! state, so a crashed worker leaves nothing behind but a reclaimable job.

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        database::Tx,
        deliveries, games, jobs as job_rows,
        models::{
            GameEntity, GameInstanceEntity, InstanceState, SheetState, SubscriptionStatus,
            TurnPhase, TurnSheetEntity,
        },
        rls::RlsScope,
        turn_sheets::{self, SheetPatch, SheetStoreError},
    },
    error::{Disposition, PipelineError},
    services::{
        dispatcher,
        jobs::{self, Job, JobOutcome, resolve_key},
    },
    sheets::template::TemplateData,
    state::{
        AppState, SharedState,
        lifecycle::is_terminal,
        turn_machine::{TurnEvent, next_phase},
    },
};

const MINT_ATTEMPTS: usize = 8;
const MISSED_DEADLINE: &str = "not returned before the turn deadline";

/// Load an instance together with its game definition.
pub(crate) fn load_instance(
    tx: &Tx<'_>,
    instance_id: Uuid,
) -> Result<(GameInstanceEntity, GameEntity), PipelineError> {
    let instance = games::get_instance(tx, instance_id)?
        .ok_or_else(|| PipelineError::NotFound(format!("instance {instance_id}")))?;
    let game = games::get_game(tx, instance.game_id)?
        .ok_or_else(|| PipelineError::NotFound(format!("game {}", instance.game_id)))?;
    Ok((instance, game))
}

/// Make the resolve job of the turn runnable now so it re-evaluates quorum.
pub(crate) fn wake_resolver(
    tx: &Tx<'_>,
    instance_id: Uuid,
    turn_number: u32,
    now: OffsetDateTime,
) -> Result<(), PipelineError> {
    if job_rows::wake(tx, &resolve_key(instance_id, turn_number), now)? {
        debug!(%instance_id, turn_number, "woke turn resolver");
    }
    Ok(())
}

/// Move a sheet to `failed`, abandon its pending deliveries and let the turn
/// re-evaluate.
pub(crate) fn fail_sheet(
    tx: &Tx<'_>,
    scope: &RlsScope,
    sheet: &TurnSheetEntity,
    reason: &str,
    now: OffsetDateTime,
) -> Result<(), PipelineError> {
    retire_sheet(tx, scope, sheet, SheetState::Failed, reason, now)?;
    warn!(sheet_id = %sheet.id, code = %sheet.code, reason, "turn sheet failed");
    advance_if_all_dispatched(tx, scope, sheet.game_instance_id, sheet.turn_number, now)?;
    wake_resolver(tx, sheet.game_instance_id, sheet.turn_number, now)
}

fn retire_sheet(
    tx: &Tx<'_>,
    scope: &RlsScope,
    sheet: &TurnSheetEntity,
    to: SheetState,
    reason: &str,
    now: OffsetDateTime,
) -> Result<(), PipelineError> {
    turn_sheets::transition(
        tx,
        scope,
        sheet.id,
        sheet.state,
        to,
        SheetPatch {
            last_error: Some(reason.to_owned()),
            ..SheetPatch::default()
        },
        now,
    )?;
    deliveries::abandon_pending(tx, sheet.id, reason, now)?;
    Ok(())
}

/// Move the turn from `emitting` to `awaiting` once no sheet of it is still
/// waiting to be rendered or dispatched.
pub(crate) fn advance_if_all_dispatched(
    tx: &Tx<'_>,
    scope: &RlsScope,
    instance_id: Uuid,
    turn_number: u32,
    now: OffsetDateTime,
) -> Result<(), PipelineError> {
    let Some(mut instance) = games::get_instance(tx, instance_id)? else {
        return Ok(());
    };
    if instance.current_turn_number != turn_number || instance.turn_phase != TurnPhase::Emitting {
        return Ok(());
    }
    let undispatched = turn_sheets::list_open_sheets(tx, scope, instance_id, turn_number)?
        .iter()
        .any(|sheet| matches!(sheet.state, SheetState::Draft | SheetState::Rendered));
    if undispatched {
        return Ok(());
    }

    instance.turn_phase = next_phase(TurnPhase::Emitting, TurnEvent::AllDispatched)?;
    instance.updated_at = now;
    if games::update_instance(tx, &instance, turn_number, TurnPhase::Emitting)? {
        info!(%instance_id, turn_number, "every sheet dispatched; awaiting scans");
        wake_resolver(tx, instance_id, turn_number, now)?;
    }
    Ok(())
}

/// `opening` job: create one draft sheet per planned sheet of every active
/// subscription, fix the deadline and queue the emits and the resolver.
///
/// A worker that finds the turn already opened exits without changes.
pub async fn open_turn(
    state: &SharedState,
    instance_id: Uuid,
    turn_number: u32,
) -> Result<JobOutcome, PipelineError> {
    let worker_state = state.clone();
    let created = state
        .db()
        .transaction(move |tx| open_turn_tx(&worker_state, tx, instance_id, turn_number))
        .await?;
    if created > 0 {
        state.notify_queue();
    }
    Ok(JobOutcome::Done)
}

fn open_turn_tx(
    state: &AppState,
    tx: &Tx<'_>,
    instance_id: Uuid,
    turn_number: u32,
) -> Result<usize, PipelineError> {
    let now = state.now();
    let (mut instance, game) = load_instance(tx, instance_id)?;
    if instance.state != InstanceState::Active
        || instance.current_turn_number != turn_number
        || instance.turn_phase != TurnPhase::Opening
    {
        debug!(
            %instance_id,
            turn_number,
            current_turn = instance.current_turn_number,
            phase = %instance.turn_phase,
            "turn already opened"
        );
        return Ok(0);
    }

    let rules = state.registry().rules(game.game_type)?;
    let scope = RlsScope::for_game(game.id);
    let deadline = now + Duration::hours(i64::from(game.turn_duration_hours));
    let mut game_state = instance.game_state.clone();
    let mut sheet_ids = Vec::new();

    for subscription in games::list_subscriptions(tx, instance_id)? {
        if subscription.status != SubscriptionStatus::Active {
            continue;
        }
        let account = games::get_account(tx, subscription.account_id)?.ok_or_else(|| {
            PipelineError::NotFound(format!("account {}", subscription.account_id))
        })?;
        for plan in rules.plan_sheets(&mut game_state, account.id)? {
            let template_data = TemplateData {
                game_name: Some(game.name.clone()),
                game_type: Some(game.game_type),
                turn_number: Some(turn_number),
                account_name: Some(account.name.clone()),
                deadline: Some(deadline),
                code: None,
                background_images: Vec::new(),
                narrative: Some(plan.narrative),
                choices: plan.choices,
            };
            let record = TurnSheetEntity {
                id: Uuid::new_v4(),
                game_instance_id: instance_id,
                turn_number,
                account_id: account.id,
                game_subscription_id: subscription.id,
                sheet_type: plan.sheet_type,
                code: state
                    .mint()
                    .mint(instance_id, turn_number, account.id, plan.sheet_type),
                state: SheetState::Draft,
                template_data,
                rendered_digest: None,
                scanned_data: None,
                deadline,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            sheet_ids.push(insert_with_fresh_code(state, tx, &scope, record)?);
        }
    }

    instance.game_state = game_state;
    instance.deadline_for_current_turn = Some(deadline);
    instance.turn_phase = next_phase(TurnPhase::Opening, TurnEvent::SheetsCreated)?;
    instance.updated_at = now;
    if !games::update_instance(tx, &instance, turn_number, TurnPhase::Opening)? {
        return Err(PipelineError::StaleInstance(instance_id));
    }

    for sheet_id in &sheet_ids {
        let emit = Job::Emit {
            game_id: game.id,
            instance_id,
            sheet_id: *sheet_id,
        };
        jobs::enqueue(tx, &emit, now, now)?;
    }
    let resolve = Job::Resolve {
        instance_id,
        turn_number,
    };
    jobs::enqueue(tx, &resolve, deadline, now)?;

    info!(
        %instance_id,
        turn_number,
        sheets = sheet_ids.len(),
        deadline = %deadline,
        "opened turn"
    );
    Ok(sheet_ids.len())
}

/// Insert `record`, minting a new code whenever the previous one collides.
fn insert_with_fresh_code(
    state: &AppState,
    tx: &Tx<'_>,
    scope: &RlsScope,
    mut record: TurnSheetEntity,
) -> Result<Uuid, PipelineError> {
    for _ in 0..MINT_ATTEMPTS {
        record.template_data.code = Some(record.code.clone());
        match turn_sheets::insert_sheet(tx, scope, &record) {
            Ok(()) => return Ok(record.id),
            Err(SheetStoreError::DuplicateCode(code)) => {
                warn!(%code, "turn sheet code collision; minting another");
                record.code = state.mint().mint(
                    record.game_instance_id,
                    record.turn_number,
                    record.account_id,
                    record.sheet_type,
                );
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(PipelineError::DuplicateCode(record.code))
}

/// `emit` job: render a draft sheet, then hand it to the dispatcher.
///
/// Each step is a compare-and-swap on the sheet state, so re-running the job
/// after success changes nothing.
pub async fn emit_sheet(
    state: &SharedState,
    game_id: Uuid,
    instance_id: Uuid,
    sheet_id: Uuid,
) -> Result<JobOutcome, PipelineError> {
    let scope = RlsScope::for_game(game_id);
    let (sheet, game) = {
        let scope = scope.clone();
        state
            .db()
            .read(move |tx| {
                let sheet = turn_sheets::get_sheet(tx, &scope, sheet_id)?;
                let (_, game) = load_instance(tx, instance_id)?;
                Ok::<_, PipelineError>((sheet, game))
            })
            .await?
    };

    if sheet.state == SheetState::Draft {
        let generator = state
            .registry()
            .lookup(game.game_type, sheet.sheet_type)?
            .generator
            .clone();
        let now = state.now();
        match generator.generate(&sheet.template_data).map_err(PipelineError::from) {
            Ok(rendered) => {
                let scope = scope.clone();
                let digest = rendered.digest.clone();
                state
                    .db()
                    .transaction(move |tx| {
                        turn_sheets::transition(
                            tx,
                            &scope,
                            sheet_id,
                            SheetState::Draft,
                            SheetState::Rendered,
                            SheetPatch {
                                rendered_digest: Some(digest),
                                ..SheetPatch::default()
                            },
                            now,
                        )
                    })
                    .await?;
                info!(%sheet_id, code = %sheet.code, digest = %rendered.digest, "rendered turn sheet");
            }
            Err(err) if err.disposition() == Disposition::FailSheet => {
                let reason = err.to_string();
                let scope = scope.clone();
                state
                    .db()
                    .transaction(move |tx| fail_sheet(tx, &scope, &sheet, &reason, now))
                    .await?;
                return Ok(JobOutcome::Done);
            }
            Err(err) => return Err(err),
        }
    }

    let dispatched = dispatcher::dispatch(state, scope, game_id, sheet_id).await?;
    if dispatched {
        state.notify_queue();
    }
    Ok(JobOutcome::Done)
}

/// `resolve` job: once every open sheet is scanned or the deadline passed,
/// apply the scanned choices, fail what was not returned, close the turn and
/// open the next one. Otherwise sleep until the deadline.
pub async fn resolve_turn(
    state: &SharedState,
    instance_id: Uuid,
    turn_number: u32,
) -> Result<JobOutcome, PipelineError> {
    let worker_state = state.clone();
    let outcome = state
        .db()
        .transaction(move |tx| resolve_turn_tx(&worker_state, tx, instance_id, turn_number))
        .await?;
    if outcome == JobOutcome::Done {
        state.notify_queue();
    }
    Ok(outcome)
}

fn resolve_turn_tx(
    state: &AppState,
    tx: &Tx<'_>,
    instance_id: Uuid,
    turn_number: u32,
) -> Result<JobOutcome, PipelineError> {
    let now = state.now();
    let (mut instance, game) = load_instance(tx, instance_id)?;
    if instance.state != InstanceState::Active || instance.current_turn_number != turn_number {
        debug!(%instance_id, turn_number, "turn already closed");
        return Ok(JobOutcome::Done);
    }
    let deadline = instance.deadline_for_current_turn.ok_or_else(|| {
        PipelineError::InvalidState(format!("instance {instance_id} has no turn deadline"))
    })?;
    let scope = RlsScope::for_game(game.id);
    let started_in = instance.turn_phase;

    let mut phase = started_in;
    match phase {
        TurnPhase::Emitting | TurnPhase::Awaiting if now >= deadline => {
            phase = next_phase(phase, TurnEvent::DeadlineElapsed)?;
        }
        TurnPhase::Emitting => return Ok(JobOutcome::Reschedule(deadline)),
        TurnPhase::Awaiting => {
            let open = turn_sheets::list_open_sheets(tx, &scope, instance_id, turn_number)?;
            let waiting = open
                .iter()
                .filter(|sheet| sheet.state != SheetState::Scanned)
                .count();
            if waiting > 0 {
                debug!(%instance_id, turn_number, waiting, "turn still awaiting scans");
                return Ok(JobOutcome::Reschedule(deadline));
            }
        }
        TurnPhase::TimedOut => {}
        TurnPhase::Opening | TurnPhase::Resolving | TurnPhase::Closed => {
            debug!(%instance_id, turn_number, %phase, "turn not resolvable in this phase");
            return Ok(JobOutcome::Done);
        }
    }
    phase = next_phase(phase, TurnEvent::BeginResolve)?;

    let rules = state.registry().rules(game.game_type)?;
    let mut sheets = turn_sheets::list_turn_sheets(tx, &scope, instance_id, turn_number)?;
    sheets.sort_by_key(|sheet| (rules.resolution_rank(sheet.sheet_type), sheet.created_at));

    let mut game_state = instance.game_state.clone();
    let (mut resolved, mut failed) = (0usize, 0usize);
    for sheet in &sheets {
        match sheet.state {
            SheetState::Scanned => {
                let mut candidate = game_state.clone();
                let applied = match &sheet.scanned_data {
                    Some(scanned) => rules
                        .resolve(&mut candidate, sheet.account_id, sheet.sheet_type, &scanned.choices)
                        .map_err(PipelineError::from),
                    None => Err(PipelineError::InvalidState(format!(
                        "scanned sheet {} has no scanned data",
                        sheet.id
                    ))),
                };
                match applied {
                    Ok(()) => {
                        game_state = candidate;
                        turn_sheets::transition(
                            tx,
                            &scope,
                            sheet.id,
                            SheetState::Scanned,
                            SheetState::Resolved,
                            SheetPatch::default(),
                            now,
                        )?;
                        resolved += 1;
                    }
                    Err(err) => {
                        let reason = match &err {
                            PipelineError::Rules(rules_err) => rules_err.to_string(),
                            other => other.to_string(),
                        };
                        warn!(sheet_id = %sheet.id, code = %sheet.code, error = %reason, "resolver rejected sheet");
                        retire_sheet(tx, &scope, sheet, SheetState::Failed, &reason, now)?;
                        failed += 1;
                    }
                }
            }
            other if is_terminal(other) => {}
            _ => {
                retire_sheet(tx, &scope, sheet, SheetState::Failed, MISSED_DEADLINE, now)?;
                failed += 1;
            }
        }
    }

    phase = next_phase(phase, TurnEvent::Resolved)?;
    instance.game_state = game_state;
    instance.current_turn_number = turn_number + 1;
    instance.deadline_for_current_turn = None;
    instance.updated_at = now;
    let completed = instance
        .turn_limit
        .is_some_and(|limit| instance.current_turn_number >= limit);
    if completed {
        instance.state = InstanceState::Completed;
        instance.turn_phase = phase;
    } else {
        instance.turn_phase = next_phase(phase, TurnEvent::Reopen)?;
    }
    if !games::update_instance(tx, &instance, turn_number, started_in)? {
        return Err(PipelineError::StaleInstance(instance_id));
    }

    if !completed {
        let opening = Job::Opening {
            instance_id,
            turn_number: instance.current_turn_number,
        };
        jobs::enqueue(tx, &opening, now, now)?;
    }
    info!(
        %instance_id,
        turn_number,
        resolved,
        failed,
        timed_out = started_in == TurnPhase::TimedOut || now >= deadline,
        completed,
        "closed turn"
    );
    Ok(JobOutcome::Done)
}

/// Withdraw a subscription: its open sheets of the current turn become
/// `abandoned` and stop gating resolution. Returns the number of sheets
/// abandoned.
pub async fn withdraw_subscription(
    state: &SharedState,
    subscription_id: Uuid,
) -> Result<usize, PipelineError> {
    let now = state.now();
    let abandoned = state
        .db()
        .transaction(move |tx| {
            let subscription = games::get_subscription(tx, subscription_id)?.ok_or_else(|| {
                PipelineError::NotFound(format!("subscription {subscription_id}"))
            })?;
            if subscription.status == SubscriptionStatus::Withdrawn {
                return Ok(0);
            }
            games::set_subscription_status(tx, subscription_id, SubscriptionStatus::Withdrawn, now)?;

            let (instance, game) = load_instance(tx, subscription.game_instance_id)?;
            let scope = RlsScope::for_game(game.id);
            let turn_number = instance.current_turn_number;
            let sheets: Vec<_> =
                turn_sheets::list_open_sheets(tx, &scope, instance.id, turn_number)?
                    .into_iter()
                    .filter(|sheet| sheet.game_subscription_id == subscription_id)
                    .collect();
            for sheet in &sheets {
                retire_sheet(tx, &scope, sheet, SheetState::Abandoned, "subscription withdrawn", now)?;
            }
            if !sheets.is_empty() {
                advance_if_all_dispatched(tx, &scope, instance.id, turn_number, now)?;
                wake_resolver(tx, instance.id, turn_number, now)?;
            }
            info!(
                %subscription_id,
                account_id = %subscription.account_id,
                instance_id = %instance.id,
                abandoned = sheets.len(),
                "subscription withdrawn"
            );
            Ok::<_, PipelineError>(sheets.len())
        })
        .await?;
    if abandoned > 0 {
        state.notify_queue();
    }
    Ok(abandoned)
}
