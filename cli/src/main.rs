//! `loom` binary entry point. One subcommand per worker process named in
//! spec.md §5, plus `init` (slot bootstrap) and `submit` (a local-dev
//! exerciser for the action pipeline, standing in for the out-of-scope
//! interpreter/data-broker/rules-lawyer AI round trip: it runs
//! `loom_core::action::run` directly against an in-process `WorldAdapter`
//! and publishes the state applier's successor, same as `apply_tick`
//! would for a AI-produced ruling).
//!
//! Grounded on the teacher's `cli/src/main.rs` `MultitoolCli` shape: one
//! top-level `Parser` with a `#[clap(subcommand)]` enum, each variant a
//! flattened `Parser` struct of its own.

use std::collections::HashMap;

use clap::Parser;
use loom_common::DataSlotArg;
use loom_common::PollIntervalArg;
use loom_core::action::ActionIntent;
use loom_core::action::ActionSource;
use loom_core::ai::OllamaProvider;
use loom_core::config::ensure_slot_tree;
use loom_core::config::Config;
use loom_core::envelope;
use loom_core::metrics::MetricsSink;
use loom_core::npc::ConversationPresence;
use loom_core::npc::MovementState;
use loom_core::npc::ReassessmentScheduler;
use loom_core::renderer::ConversationHistory;
use loom_core::roller::RollerState;
use loom_core::rules::ActionRegistry;
use loom_core::rules::TagRuleRegistry;
use loom_core::session::SessionFence;
use loom_core::world::EntityLocation;
use loom_core::world::TilePos;
use loom_protocol::EnvelopeBuilder;
use loom_protocol::Meta;
use loom_protocol::Stage;
use loom_protocol::Status;
use tracing_subscriber::EnvFilter;

use loom_cli::registry::default_action_defs;
use loom_cli::state::WorldAdapter;
use loom_cli::state::WorldStore;
use loom_cli::worker;

/// The Loom message-bus core: file-backed worker processes over a shared
/// on-disk queue.
///
/// Run a single subcommand forever with `--poll-interval-ms`, or once with
/// `--once`, so the same binary works as a long-lived process or a
/// scriptable dev tool.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct LoomCli {
    #[clap(subcommand)]
    subcommand: Subcommand_,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand_ {
    /// Create the data-slot directory tree and the session file.
    Init(DataSlotArg),

    /// Run one player action through the pipeline locally and publish its
    /// result, bypassing the (out-of-scope) AI interpreter/broker/rules
    /// lawyer round trip.
    Submit(SubmitArgs),

    /// C4 router: fan Log entries out to the Outbox.
    Router(WorkerArgs),

    /// C8 state applier: claim rulings, apply effects, emit `applied_*`.
    Apply(WorkerArgs),

    /// C10 renderer: claim `applied_*` envelopes and narrate them via AI.
    Render(RenderArgs),

    /// C9 roller: claim roll requests/inputs and resolve dice.
    Roll(WorkerArgs),

    /// C11 NPC movement controller tick loop.
    Npc(WorkerArgs),

    /// Stale-`processing` recovery sweep (spec.md §7).
    Recover(WorkerArgs),
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    #[clap(flatten)]
    slot: DataSlotArg,

    /// `actor.<id>` performing the action.
    #[arg(long)]
    actor: String,

    /// Verb from the action registry (INSPECT, ATTACK, COMMUNICATE, MOVE,
    /// USE, DEFEND, HELP).
    #[arg(long)]
    verb: String,

    /// Explicit target ref, if any (`npc.<id>`, `actor.<id>`, …).
    #[arg(long)]
    target: Option<String>,

    /// Raw player utterance, echoed into the narration prompt.
    #[arg(long, default_value = "")]
    text: String,
}

#[derive(Debug, Parser)]
struct WorkerArgs {
    #[clap(flatten)]
    slot: DataSlotArg,

    #[clap(flatten)]
    poll: PollIntervalArg,

    /// Run one tick and exit instead of looping forever.
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[derive(Debug, Parser)]
struct RenderArgs {
    #[clap(flatten)]
    worker: WorkerArgs,

    /// Model name passed to the AI provider.
    #[arg(long, default_value = "llama3")]
    model: String,

    /// Ollama host to narrate against.
    #[arg(long, default_value = "http://localhost:11434")]
    ai_host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = LoomCli::parse();

    match cli.subcommand {
        Subcommand_::Init(slot) => run_init(slot).await,
        Subcommand_::Submit(args) => run_submit(args).await,
        Subcommand_::Router(args) => run_router(args).await,
        Subcommand_::Apply(args) => run_apply(args).await,
        Subcommand_::Render(args) => run_render(args).await,
        Subcommand_::Roll(args) => run_roll(args).await,
        Subcommand_::Npc(args) => run_npc(args).await,
        Subcommand_::Recover(args) => run_recover(args).await,
    }
}

fn config_for_slot(data_slot: u32) -> Config {
    let mut cfg = Config::from_env();
    cfg.data_slot = data_slot;
    cfg
}

async fn run_init(slot: DataSlotArg) -> anyhow::Result<()> {
    let cfg = config_for_slot(slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let fence = SessionFence::start(cfg.session_file_path()).await?;
    tracing::info!(
        summary = %loom_common::config_summary::summarize_config(&cfg),
        session_id = %fence.session_id(),
        "slot initialized"
    );
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> anyhow::Result<()> {
    let cfg = config_for_slot(args.slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let fence = SessionFence::start(cfg.session_file_path()).await?;

    let verb = args.verb.to_uppercase();
    let world_store = WorldStore::new(cfg.world_path());
    let mut world = world_store.load()?;

    let actor_id = args.actor.strip_prefix("actor.").unwrap_or(&args.actor).to_string();
    let actor_location = world
        .actors
        .get(&actor_id)
        .and_then(|a| a.location.clone())
        .unwrap_or(EntityLocation {
            world_tile: TilePos::new(0, 0),
            region_tile: TilePos::new(0, 0),
            place_id: None,
            tile: TilePos::new(0, 0),
            elevation: 0.0,
        });

    let intent = ActionIntent {
        id: format!("submit-{}", args.actor),
        actor_ref: format!("actor.{actor_id}"),
        verb: verb.clone(),
        action_type: verb.clone(),
        source: ActionSource::PlayerInput,
        actor_location,
        explicit_ui_target: args.target.clone(),
        target_ref: args.target.clone(),
        target_type: None,
        last_target_ref: None,
        original_input: Some(args.text.clone()),
        tool_ref: None,
        ammo_ref: None,
        strength: world.actors.get(&actor_id).map(|a| a.strength).unwrap_or(0),
    };

    let registry = ActionRegistry::new(default_action_defs());
    let tag_registry = TagRuleRegistry::new(world.tag_rules.clone());

    let result = {
        let mut adapter = WorldAdapter::new(&mut world);
        loom_core::action::run(&intent, &registry, &tag_registry, &mut adapter)
    };
    world_store.save(&world)?;

    if !result.success {
        tracing::warn!(reason = ?result.failure_reason, verb = %verb, "action pipeline rejected submission");
        return Ok(());
    }

    let correlation_id = intent.id.clone();
    let effects_text = result
        .effects
        .iter()
        .map(|e| e.command_text.clone())
        .collect::<Vec<_>>()
        .join("\n");
    let effects_applied = result.effects.iter().filter(|e| e.applied).count() as u32;

    let input_envelope = envelope::new(
        EnvelopeBuilder {
            sender: "user".to_string(),
            content: args.text.clone(),
            kind: Some("user_input".to_string()),
            stage: Some(Stage::new("user_input", 1)),
            status: Some(Status::Queued),
            correlation_id: Some(correlation_id.clone()),
            meta: Meta {
                action_verb: Some(verb.clone()),
                ..Default::default()
            },
            ..Default::default()
        },
        worker::next_log_index(&cfg)?,
        Some(&fence.session_id()),
    );
    worker::publish(&cfg, input_envelope)?;

    let applied_envelope = envelope::new(
        EnvelopeBuilder {
            sender: "state_applier".to_string(),
            content: args.text.clone(),
            stage: Some(Stage::new("applied", 1)),
            status: Some(Status::Sent),
            correlation_id: Some(correlation_id),
            meta: Meta {
                effects: Some(effects_text),
                effects_applied: Some(effects_applied),
                action_verb: Some(verb),
                ..Default::default()
            },
            ..Default::default()
        },
        worker::next_log_index(&cfg)?,
        Some(&fence.session_id()),
    );
    worker::publish(&cfg, applied_envelope)?;

    tracing::info!(observers = ?result.observers, "action applied");
    Ok(())
}

async fn run_router(args: WorkerArgs) -> anyhow::Result<()> {
    let cfg = config_for_slot(args.slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let fence = SessionFence::start(cfg.session_file_path()).await?;

    run_loop(args.poll.interval(), args.once, || {
        let routed = worker::router_tick(&cfg, &fence)?;
        if routed > 0 {
            tracing::info!(routed, "router tick");
        }
        Ok(())
    })
    .await
}

async fn run_apply(args: WorkerArgs) -> anyhow::Result<()> {
    let cfg = config_for_slot(args.slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let fence = SessionFence::start(cfg.session_file_path()).await?;
    let world_store = WorldStore::new(cfg.world_path());

    if args.once {
        let applied = worker::apply_tick(&cfg, &fence, &world_store).await?;
        if applied > 0 {
            tracing::info!(applied, "apply tick");
        }
        return Ok(());
    }
    let mut timer = tokio::time::interval(args.poll.interval());
    loop {
        tokio::select! {
            _ = timer.tick() => {
                match worker::apply_tick(&cfg, &fence, &world_store).await {
                    Ok(applied) if applied > 0 => tracing::info!(applied, "apply tick"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "apply tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down on ctrl-c");
                return Ok(());
            }
        }
    }
}

async fn run_render(args: RenderArgs) -> anyhow::Result<()> {
    let cfg = config_for_slot(args.worker.slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let fence = SessionFence::start(cfg.session_file_path()).await?;
    let ai = OllamaProvider::new(args.ai_host);
    let mut history = ConversationHistory::default();
    let model = args.model;

    if args.worker.once {
        let rendered = worker::render_tick(&cfg, &fence, &mut history, &ai, &model).await?;
        if rendered > 0 {
            tracing::info!(rendered, "render tick");
        }
        return Ok(());
    }
    let mut timer = tokio::time::interval(args.worker.poll.interval());
    loop {
        tokio::select! {
            _ = timer.tick() => {
                match worker::render_tick(&cfg, &fence, &mut history, &ai, &model).await {
                    Ok(rendered) if rendered > 0 => tracing::info!(rendered, "render tick"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "render tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down on ctrl-c");
                return Ok(());
            }
        }
    }
}

async fn run_roll(args: WorkerArgs) -> anyhow::Result<()> {
    let cfg = config_for_slot(args.slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let fence = SessionFence::start(cfg.session_file_path()).await?;
    let mut roller = RollerState::new();

    run_loop(args.poll.interval(), args.once, || {
        let resolved = worker::roller_tick(&cfg, &fence, &mut roller)?;
        if resolved > 0 {
            tracing::info!(resolved, "roll tick");
        }
        Ok(())
    })
    .await
}

async fn run_npc(args: WorkerArgs) -> anyhow::Result<()> {
    let cfg = config_for_slot(args.slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let world_store = WorldStore::new(cfg.world_path());
    let mut movement: HashMap<String, MovementState> = HashMap::new();
    let mut presence = ConversationPresence::default();
    let mut scheduler = ReassessmentScheduler::default();

    run_loop(args.poll.interval(), args.once, || {
        let now_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let commands = worker::npc_tick(&cfg, &world_store, &mut movement, &mut presence, &mut scheduler, now_ms)?;
        if !commands.is_empty() {
            tracing::debug!(count = commands.len(), "npc tick commands");
        }
        Ok(())
    })
    .await
}

async fn run_recover(args: WorkerArgs) -> anyhow::Result<()> {
    let cfg = config_for_slot(args.slot.data_slot);
    ensure_slot_tree(&cfg.slot_dir())?;
    let metrics = MetricsSink::new(cfg.metrics_dir().join("worker.jsonc"));

    run_loop(args.poll.interval(), args.once, || {
        let recovered = worker::recover_tick(&cfg, &metrics)?;
        if recovered > 0 {
            tracing::info!(recovered, "recovery sweep");
        }
        Ok(())
    })
    .await
}

/// Runs `tick` once, then forever on `interval` until ctrl-c, unless
/// `once` is set.
async fn run_loop<F>(interval: std::time::Duration, once: bool, mut tick: F) -> anyhow::Result<()>
where
    F: FnMut() -> loom_core::Result<()>,
{
    if once {
        tick()?;
        return Ok(());
    }
    let mut timer = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = tick() {
                    tracing::error!(error = %e, "worker tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down on ctrl-c");
                return Ok(());
            }
        }
    }
}
