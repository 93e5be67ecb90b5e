//! Scan intake: accepts returned sheet images, reads them and binds their
//! choices to the sheet their code names.
//!
//! Images that cannot be read or bound are parked as rejected ingest
//! records; an operator may resubmit them with a corrected sheet type hint.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        database::Tx,
        models::{InstanceState, ScanSource, ScanState, ScannedData, SheetState, SheetType},
        rls::RlsScope,
        scans::{self, Rejection},
        turn_sheets::{self, SheetBinding, SheetPatch, SheetStoreError},
    },
    error::PipelineError,
    services::{
        jobs::{self, Job, JobOutcome},
        orchestrator,
    },
    sheets::{
        code::SheetCode,
        scanner::{ScanError, ScannedSheet},
    },
    state::{SharedState, lifecycle::awaits_scan},
};

/// Store an inbound image and queue its ingestion. Returns the ingest
/// record id.
pub async fn submit(
    state: &SharedState,
    image: Vec<u8>,
    source: ScanSource,
    sheet_type_hint: Option<SheetType>,
) -> Result<Uuid, PipelineError> {
    let now = state.now();
    let bytes = image.len();
    let scan_id = state
        .db()
        .transaction(move |tx| {
            let scan_id = scans::insert_scan(tx, &image, &source, sheet_type_hint, now)?;
            let ingest = Job::IngestScan {
                scan_id,
                submission: 1,
            };
            jobs::enqueue(tx, &ingest, now, now)?;
            Ok::<_, PipelineError>(scan_id)
        })
        .await?;
    info!(%scan_id, bytes, hint = ?sheet_type_hint, "accepted scan");
    state.notify_queue();
    Ok(scan_id)
}

/// Put a rejected scan back into the pipeline, optionally with a new sheet
/// type hint. Returns the new submission number.
pub async fn resubmit(
    state: &SharedState,
    scan_id: Uuid,
    sheet_type_hint: Option<SheetType>,
) -> Result<u32, PipelineError> {
    let now = state.now();
    let submission = state
        .db()
        .transaction(move |tx| {
            let Some(submission) = scans::resubmit(tx, scan_id, sheet_type_hint, now)? else {
                return match scans::get_scan(tx, scan_id)? {
                    Some(scan) => Err(PipelineError::InvalidState(format!(
                        "scan {scan_id} is {} and cannot be resubmitted",
                        scan.state
                    ))),
                    None => Err(PipelineError::NotFound(format!("scan {scan_id}"))),
                };
            };
            let ingest = Job::IngestScan {
                scan_id,
                submission,
            };
            jobs::enqueue(tx, &ingest, now, now)?;
            Ok(submission)
        })
        .await?;
    info!(%scan_id, submission, hint = ?sheet_type_hint, "resubmitted scan");
    state.notify_queue();
    Ok(submission)
}

/// `ingest_scan` job: read one submission of a scan and bind it.
pub async fn ingest(
    state: &SharedState,
    scan_id: Uuid,
    submission: u32,
) -> Result<JobOutcome, PipelineError> {
    let scan = state
        .db()
        .read(move |tx| scans::get_scan(tx, scan_id))
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("scan {scan_id}")))?;
    if scan.state != ScanState::Pending || scan.submission != submission {
        debug!(%scan_id, submission, state = %scan.state, "scan submission already handled");
        return Ok(JobOutcome::Done);
    }

    let image: Arc<[u8]> = Arc::from(scan.image);
    let scanned = match read_sheet(state, image.clone(), scan.sheet_type_hint).await {
        Ok(scanned) => scanned,
        Err(ScanError::Timeout) => return Err(PipelineError::TransportTimeout),
        Err(err) => {
            reject(state, scan_id, err.into()).await?;
            return Ok(JobOutcome::Done);
        }
    };

    let code = scanned.code.clone();
    let located = state
        .db()
        .read(move |tx| locate(tx, &code))
        .await?;
    let Some((binding, bound_type)) = located else {
        reject(state, scan_id, PipelineError::UnknownCode(scanned.code)).await?;
        return Ok(JobOutcome::Done);
    };

    let scanned = if scanned.sheet_type == bound_type {
        scanned
    } else {
        debug!(%scan_id, read_as = %scanned.sheet_type, bound_type = %bound_type, "rescanning as the bound sheet type");
        let scanner = state
            .registry()
            .scanners_in_order(Some(bound_type))
            .into_iter()
            .find(|scanner| scanner.sheet_type() == bound_type);
        match scanner {
            Some(scanner) => match scanner.scan(image).await {
                Ok(rescanned) => rescanned,
                Err(ScanError::Timeout) => return Err(PipelineError::TransportTimeout),
                Err(err) => {
                    reject(state, scan_id, err.into()).await?;
                    return Ok(JobOutcome::Done);
                }
            },
            None => {
                reject(
                    state,
                    scan_id,
                    PipelineError::InvalidState(format!("no scanner for {bound_type} sheets")),
                )
                .await?;
                return Ok(JobOutcome::Done);
            }
        }
    };

    bind(state, scan_id, binding, scanned).await
}

/// Try every scanner, hinted type first, while failures depend on the
/// sheet type. When all of them fail, the first failure is reported.
async fn read_sheet(
    state: &SharedState,
    image: Arc<[u8]>,
    hint: Option<SheetType>,
) -> Result<ScannedSheet, ScanError> {
    let mut first = None;
    for scanner in state.registry().scanners_in_order(hint) {
        match scanner.scan(image.clone()).await {
            Ok(scanned) => return Ok(scanned),
            Err(err) if err.depends_on_sheet_type() => {
                debug!(sheet_type = %scanner.sheet_type(), error = %err, "scanner could not read choices");
                first.get_or_insert(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(first.unwrap_or_else(|| ScanError::OcrFailed("no scanner registered".into())))
}

fn locate(
    tx: &Tx<'_>,
    code: &SheetCode,
) -> Result<Option<(SheetBinding, SheetType)>, PipelineError> {
    let Some(binding) = turn_sheets::find_binding(tx, code)? else {
        return Ok(None);
    };
    let sheet = turn_sheets::get_sheet(tx, &RlsScope::for_game(binding.game_id), binding.turn_sheet_id)?;
    Ok(Some((binding, sheet.sheet_type)))
}

async fn bind(
    state: &SharedState,
    scan_id: Uuid,
    binding: SheetBinding,
    scanned: ScannedSheet,
) -> Result<JobOutcome, PipelineError> {
    let now = state.now();
    let scope = RlsScope::for_game(binding.game_id);
    let refused = state
        .db()
        .transaction::<_, _, PipelineError>(move |tx| {
            let (instance, _) = orchestrator::load_instance(tx, binding.game_instance_id)?;
            if instance.state != InstanceState::Active {
                return Ok(Some(PipelineError::InvalidState(format!(
                    "instance {} is {}",
                    instance.id, instance.state
                ))));
            }
            let data = ScannedData {
                choices: scanned.choices,
                scan_id,
            };
            match turn_sheets::bind_scan(tx, &scope, &scanned.code, data, now) {
                Ok(sheet) => {
                    scans::mark_bound(tx, scan_id, &sheet.code, sheet.id, now)?;
                    orchestrator::wake_resolver(tx, sheet.game_instance_id, sheet.turn_number, now)?;
                    info!(%scan_id, sheet_id = %sheet.id, code = %sheet.code, "bound scan to turn sheet");
                    Ok(None)
                }
                Err(
                    err @ (SheetStoreError::NotAwaitingScan { .. } | SheetStoreError::UnknownCode(_)),
                ) => Ok(Some(err.into())),
                Err(err) => Err(err.into()),
            }
        })
        .await?;
    match refused {
        Some(err) => reject(state, scan_id, err).await?,
        None => state.notify_queue(),
    }
    Ok(JobOutcome::Done)
}

/// Park a scan as rejected. A code whose sheet still awaits a scan moves
/// that sheet to `received`, so the paper is known to have come back.
pub async fn reject(
    state: &SharedState,
    scan_id: Uuid,
    err: PipelineError,
) -> Result<(), PipelineError> {
    let now = state.now();
    let kind = err.kind();
    let message = err.to_string();
    let code = match &err {
        PipelineError::ChoiceExtractionFailed { code, .. }
        | PipelineError::UnknownCode(code)
        | PipelineError::NotAwaitingScan { code, .. } => Some(code.clone()),
        _ => None,
    };
    let received = matches!(err, PipelineError::ChoiceExtractionFailed { .. });
    state
        .db()
        .transaction(move |tx| {
            let binding = match &code {
                Some(code) => turn_sheets::find_binding(tx, code)?,
                None => None,
            };
            if let (true, Some(binding)) = (received, binding) {
                let scope = RlsScope::for_game(binding.game_id);
                let sheet = turn_sheets::get_sheet(tx, &scope, binding.turn_sheet_id)?;
                if awaits_scan(sheet.state) && sheet.state != SheetState::Received {
                    turn_sheets::transition(
                        tx,
                        &scope,
                        sheet.id,
                        sheet.state,
                        SheetState::Received,
                        SheetPatch {
                            last_error: Some(message.clone()),
                            ..SheetPatch::default()
                        },
                        now,
                    )?;
                }
            }
            scans::mark_rejected(
                tx,
                scan_id,
                Rejection {
                    kind,
                    message: &message,
                    code: code.as_ref(),
                    turn_sheet_id: binding.map(|binding| binding.turn_sheet_id),
                },
                now,
            )?;
            warn!(%scan_id, kind, error = %message, "scan rejected");
            Ok::<_, PipelineError>(())
        })
        .await
}
