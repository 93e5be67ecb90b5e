//! End-to-end runs of the turn pipeline against an in-memory store, a manual
//! clock and recording transports.

use std::sync::Arc;

use playbymail_back::{
    config::AppConfig,
    dao::{
        database::DbHandle,
        models::{
            AttemptState, DeliveryChannel, GameType, InstanceState, ScanSource, ScanState,
            SheetState, SheetType, TurnSheetEntity,
        },
        rls::RlsScope,
        turn_sheets,
    },
    dto::admin::{
        CreateAccountRequest, CreateGameRequest, CreateInstanceRequest, SubscribeRequest,
        TurnSheetSummary,
    },
    error::PipelineError,
    services::{admin_service, intake, jobs::JobOutcome, orchestrator, worker},
    sheets::{ocr::EmbeddedTextOcr, registry::ProcessorRegistry},
    state::{AppState, SharedState, clock::ManualClock},
    transport::{TransportSet, recording::RecordingTransport, spool::LocalSpoolTransport},
};
use tempfile::TempDir;
use time::{Duration, macros::datetime};
use uuid::Uuid;

struct Harness {
    state: SharedState,
    clock: Arc<ManualClock>,
    email: RecordingTransport,
    post: RecordingTransport,
    _spool: TempDir,
}

impl Harness {
    fn new() -> Self {
        let spool = tempfile::tempdir().unwrap();
        let email = RecordingTransport::new(DeliveryChannel::Email);
        let post = RecordingTransport::new(DeliveryChannel::PhysicalPost);
        let mut transports = TransportSet::default();
        transports
            .insert(Arc::new(email.clone()))
            .insert(Arc::new(post.clone()))
            .insert(Arc::new(LocalSpoolTransport::new(spool.path())));

        let clock = Arc::new(ManualClock::new(datetime!(2026-05-01 10:00 UTC)));
        let state = AppState::with_clock(
            DbHandle::open_in_memory().unwrap(),
            ProcessorRegistry::with_defaults(Arc::new(EmbeddedTextOcr)),
            transports,
            AppConfig::default(),
            clock.clone(),
        );
        Self {
            state,
            clock,
            email,
            post,
            _spool: spool,
        }
    }

    async fn drain(&self) {
        worker::drain(&self.state).await.unwrap();
    }

    /// Game with a one week turn and one pending instance.
    async fn instance(&self, players: u32) -> (Uuid, Uuid) {
        let game = admin_service::create_game(
            &self.state,
            CreateGameRequest {
                name: "The Lost Town".into(),
                game_type: GameType::Adventure,
                turn_duration_hours: 168,
            },
        )
        .await
        .unwrap();
        let instance = admin_service::create_instance(
            &self.state,
            game.id,
            CreateInstanceRequest {
                required_player_count: players,
                turn_limit: None,
            },
        )
        .await
        .unwrap();
        (game.id, instance.id)
    }

    /// Account subscribed to `instance_id` through `channels`. Returns the
    /// account and subscription ids.
    async fn player(
        &self,
        instance_id: Uuid,
        name: &str,
        channels: Vec<DeliveryChannel>,
    ) -> (Uuid, Uuid) {
        let account = admin_service::create_account(
            &self.state,
            CreateAccountRequest {
                name: name.into(),
                email: Some(format!("{}@example.com", name.to_lowercase())),
                postal_address: Some(format!("{name}, 1 Harbour Road, Lost Town")),
            },
        )
        .await
        .unwrap();
        let subscription = admin_service::subscribe(
            &self.state,
            instance_id,
            SubscribeRequest {
                account_id: account.id,
                delivery_channels: channels,
            },
        )
        .await
        .unwrap();
        (account.id, subscription.id)
    }

    async fn sheets(&self, instance_id: Uuid, turn: u32) -> Vec<TurnSheetSummary> {
        admin_service::list_turn_sheets(&self.state, instance_id, turn)
            .await
            .unwrap()
    }

    async fn sheet(&self, game_id: Uuid, sheet_id: Uuid) -> TurnSheetEntity {
        self.state
            .db()
            .read(move |tx| {
                let sheet = turn_sheets::get_sheet(tx, &RlsScope::for_game(game_id), sheet_id)?;
                Ok::<_, PipelineError>(sheet)
            })
            .await
            .unwrap()
    }

    async fn scan(&self, text: String) -> Uuid {
        let source = ScanSource {
            origin: "test-scanner".into(),
            file_name: Some("sheet.txt".into()),
        };
        intake::submit(&self.state, text.into_bytes(), source, None)
            .await
            .unwrap()
    }

    async fn turn(&self, instance_id: Uuid) -> u32 {
        admin_service::get_instance(&self.state, instance_id)
            .await
            .unwrap()
            .current_turn_number
    }
}

/// What the embedded OCR reads off a returned location sheet with one box marked.
fn marked_location_sheet(code: &str, exit: &str) -> String {
    let options = ["The market", "The dark alley", "The old well"]
        .iter()
        .map(|option| {
            let mark = if *option == exit { "X" } else { " " };
            format!("[{mark}] {option}")
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Turn Sheet Code: {code}\nSheet Type: location_choice\n\
         Where will you go next? Mark one box.\n{options}\n"
    )
}

fn location_sheet(sheets: &[TurnSheetSummary], account_id: Uuid) -> &TurnSheetSummary {
    sheets
        .iter()
        .find(|sheet| sheet.account_id == account_id && sheet.sheet_type == SheetType::LocationChoice)
        .unwrap()
}

#[tokio::test]
async fn email_only_turn_is_sent_scanned_and_resolved() {
    let app = Harness::new();
    let (game_id, instance_id) = app.instance(1).await;
    let (ann, _) = app
        .player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();
    app.drain().await;

    let sheets = app.sheets(instance_id, 0).await;
    assert_eq!(sheets.len(), 1);
    let sheet = &sheets[0];
    let (left, right) = sheet.code.split_once('-').unwrap();
    assert_eq!((left.len(), right.len()), (6, 6));
    assert_eq!(sheet.state, SheetState::Delivered);
    assert_eq!(sheet.account_id, ann);
    assert_eq!(app.email.deliveries().len(), 1);
    assert_eq!(app.email.deliveries()[0].code, sheet.code);

    app.scan(marked_location_sheet(&sheet.code, "The dark alley"))
        .await;
    app.drain().await;

    let scanned = app.sheet(game_id, sheet.id).await;
    assert_eq!(scanned.state, SheetState::Resolved);
    let choices = scanned.scanned_data.unwrap().choices;
    assert_eq!(choices.get("a"), Some(&vec!["The dark alley".to_owned()]));
    assert_eq!(app.turn(instance_id).await, 1);

    let next_turn = app.sheets(instance_id, 1).await;
    assert!(!next_turn.is_empty());
    assert!(next_turn.iter().all(|next| next.code != sheet.code));
}

#[tokio::test]
async fn failing_channel_is_abandoned_while_the_other_delivers() {
    let app = Harness::new();
    let (_, instance_id) = app.instance(1).await;
    app.player(
        instance_id,
        "Ann",
        vec![DeliveryChannel::Email, DeliveryChannel::PhysicalPost],
    )
    .await;
    app.email.fail_next(3, 500);
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();

    app.drain().await;
    for _ in 0..3 {
        app.clock.advance(Duration::minutes(30));
        app.drain().await;
    }

    let sheets = app.sheets(instance_id, 0).await;
    assert_eq!(sheets.len(), 1);
    let sheet = &sheets[0];
    assert_eq!(sheet.state, SheetState::Delivered);

    let email: Vec<_> = sheet
        .deliveries
        .iter()
        .filter(|attempt| attempt.channel == DeliveryChannel::Email)
        .collect();
    assert_eq!(email.len(), 3);
    assert_eq!(email.last().unwrap().state, AttemptState::Abandoned);
    assert!(email[..2].iter().all(|attempt| attempt.state == AttemptState::Failed));

    let post: Vec<_> = sheet
        .deliveries
        .iter()
        .filter(|attempt| attempt.channel == DeliveryChannel::PhysicalPost)
        .collect();
    assert_eq!(post.len(), 1);
    assert_eq!(post[0].state, AttemptState::Succeeded);

    assert_eq!(app.email.calls(), 3);
    assert!(app.email.deliveries().is_empty());
    assert_eq!(app.post.deliveries().len(), 1);
}

#[tokio::test]
async fn deadline_closes_the_turn_and_fails_unscanned_sheets() {
    let app = Harness::new();
    let (game_id, instance_id) = app.instance(2).await;
    let (ann, _) = app
        .player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    let (bob, _) = app
        .player(instance_id, "Bob", vec![DeliveryChannel::Email])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();
    app.drain().await;

    let sheets = app.sheets(instance_id, 0).await;
    let anns = location_sheet(&sheets, ann).id;
    let bobs = location_sheet(&sheets, bob).id;
    let code = location_sheet(&sheets, ann).code.clone();
    app.scan(marked_location_sheet(&code, "The market")).await;
    app.drain().await;

    assert_eq!(app.sheet(game_id, anns).await.state, SheetState::Scanned);
    assert_eq!(app.turn(instance_id).await, 0);

    app.clock.advance(Duration::hours(169));
    app.drain().await;

    assert_eq!(app.sheet(game_id, anns).await.state, SheetState::Resolved);
    let missed = app.sheet(game_id, bobs).await;
    assert_eq!(missed.state, SheetState::Failed);
    assert!(missed.last_error.is_some());
    assert_eq!(app.turn(instance_id).await, 1);
}

#[tokio::test]
async fn unreadable_scan_is_kept_and_leaves_sheets_alone() {
    let app = Harness::new();
    let (_, instance_id) = app.instance(1).await;
    app.player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();
    app.drain().await;
    let before = app.sheets(instance_id, 0).await;

    let scan_id = app
        .scan("a coffee stain and nothing else".to_owned())
        .await;
    app.drain().await;

    let scan = admin_service::get_scan(&app.state, scan_id).await.unwrap();
    assert_eq!(scan.state, ScanState::Rejected);
    assert_eq!(scan.error_kind.as_deref(), Some("code_not_recognised"));
    assert!(scan.image_bytes > 0);
    assert_eq!(scan.turn_sheet_id, None);

    let rejected = admin_service::list_rejected_scans(&app.state).await.unwrap();
    assert_eq!(rejected.len(), 1);

    let after = app.sheets(instance_id, 0).await;
    assert_eq!(
        before.iter().map(|sheet| sheet.state).collect::<Vec<_>>(),
        after.iter().map(|sheet| sheet.state).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn concurrent_openings_create_one_set_of_sheets() {
    let app = Harness::new();
    let (_, instance_id) = app.instance(2).await;
    app.player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    app.player(instance_id, "Bob", vec![DeliveryChannel::PhysicalPost])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        orchestrator::open_turn(&app.state, instance_id, 0),
        orchestrator::open_turn(&app.state, instance_id, 0),
    );
    first.unwrap();
    second.unwrap();

    let sheets = app.sheets(instance_id, 0).await;
    assert_eq!(sheets.len(), 2);
    let mut codes: Vec<_> = sheets.iter().map(|sheet| sheet.code.clone()).collect();
    codes.sort();
    codes.dedup();
    assert_eq!(codes.len(), 2);

    app.drain().await;
    assert_eq!(app.sheets(instance_id, 0).await.len(), 2);
    assert_eq!(app.turn(instance_id).await, 0);
}

#[tokio::test]
async fn withdrawn_player_no_longer_gates_the_turn() {
    let app = Harness::new();
    let (game_id, instance_id) = app.instance(2).await;
    let (ann, _) = app
        .player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    let (bob, bobs_subscription) = app
        .player(instance_id, "Bob", vec![DeliveryChannel::Email])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();
    app.drain().await;

    let sheets = app.sheets(instance_id, 0).await;
    let anns = location_sheet(&sheets, ann);
    let anns = (anns.id, anns.code.clone());
    let bobs = location_sheet(&sheets, bob).id;

    admin_service::withdraw_subscription(&app.state, bobs_subscription)
        .await
        .unwrap();
    app.drain().await;

    assert_eq!(app.sheet(game_id, bobs).await.state, SheetState::Abandoned);
    assert_eq!(app.turn(instance_id).await, 0);

    app.scan(marked_location_sheet(&anns.1, "The old well")).await;
    app.drain().await;

    assert_eq!(app.sheet(game_id, anns.0).await.state, SheetState::Resolved);
    assert_eq!(app.sheet(game_id, bobs).await.state, SheetState::Abandoned);
    assert_eq!(app.turn(instance_id).await, 1);

    let next_turn = app.sheets(instance_id, 1).await;
    assert!(next_turn.iter().all(|sheet| sheet.account_id == ann));

    let instance = admin_service::get_instance(&app.state, instance_id)
        .await
        .unwrap();
    assert_eq!(instance.state, InstanceState::Active);
}

#[tokio::test]
async fn emitting_a_delivered_sheet_again_changes_nothing() {
    let app = Harness::new();
    let (game_id, instance_id) = app.instance(1).await;
    app.player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();
    app.drain().await;

    let before = app.sheets(instance_id, 0).await;
    let sheet_id = before[0].id;
    let digest = app.sheet(game_id, sheet_id).await.rendered_digest;
    assert_eq!(before[0].state, SheetState::Delivered);

    let outcome = orchestrator::emit_sheet(&app.state, game_id, instance_id, sheet_id)
        .await
        .unwrap();
    assert_eq!(outcome, JobOutcome::Done);
    assert_eq!(worker::drain(&app.state).await.unwrap(), 0);

    let after = app.sheets(instance_id, 0).await;
    assert_eq!(after[0].state, SheetState::Delivered);
    assert_eq!(after[0].deliveries.len(), before[0].deliveries.len());
    assert_eq!(app.sheet(game_id, sheet_id).await.rendered_digest, digest);
    assert_eq!(app.email.deliveries().len(), 1);
}

#[tokio::test]
async fn rejected_choice_fails_only_that_sheet() {
    let app = Harness::new();
    let (game_id, instance_id) = app.instance(2).await;
    let (ann, _) = app
        .player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    let (bob, _) = app
        .player(instance_id, "Bob", vec![DeliveryChannel::Email])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();
    app.drain().await;

    let sheets = app.sheets(instance_id, 0).await;
    let anns = location_sheet(&sheets, ann);
    let bobs = location_sheet(&sheets, bob);
    let (anns_id, bobs_id) = (anns.id, bobs.id);
    app.scan(marked_location_sheet(&anns.code, "The moon")).await;
    app.scan(marked_location_sheet(&bobs.code, "The market"))
        .await;
    app.drain().await;

    let rejected = app.sheet(game_id, anns_id).await;
    assert_eq!(rejected.state, SheetState::Failed);
    assert!(rejected.last_error.unwrap().contains("The moon"));
    assert_eq!(app.sheet(game_id, bobs_id).await.state, SheetState::Resolved);
    assert_eq!(app.turn(instance_id).await, 1);
    assert!(
        app.sheets(instance_id, 1)
            .await
            .iter()
            .any(|sheet| sheet.account_id == ann)
    );
}

#[tokio::test]
async fn sheet_too_long_to_render_fails_and_the_turn_proceeds() {
    let app = Harness::new();
    let (game_id, instance_id) = app.instance(1).await;
    app.player(instance_id, "Ann", vec![DeliveryChannel::Email])
        .await;
    admin_service::start_instance(&app.state, instance_id)
        .await
        .unwrap();
    assert!(worker::run_once(&app.state).await.unwrap());

    let draft = app.sheets(instance_id, 0).await.remove(0);
    let sheet_id = draft.id;
    let mut template = app.sheet(game_id, sheet_id).await.template_data;
    template.narrative = Some(
        (1..=60)
            .map(|index| format!("Chapter {index}: the fog thickens."))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    let template = serde_json::to_string(&template).unwrap();
    app.state
        .db()
        .transaction(move |tx| {
            tx.execute(
                "UPDATE turn_sheets SET template_data = ?1 WHERE id = ?2",
                [template, sheet_id.to_string()],
            )?;
            Ok::<_, PipelineError>(())
        })
        .await
        .unwrap();
    app.drain().await;

    let failed = app.sheet(game_id, sheet_id).await;
    assert_eq!(failed.state, SheetState::Failed);
    assert!(failed.last_error.unwrap().contains("invalid template"));
    assert!(
        app.email
            .deliveries()
            .iter()
            .all(|delivery| delivery.code != draft.code)
    );
    assert_eq!(app.turn(instance_id).await, 1);
}
