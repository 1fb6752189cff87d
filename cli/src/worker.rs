//! One-tick bodies for each worker process (spec.md §5's "multiple
//! independent worker processes polling a shared on-disk bus"). `main.rs`
//! wraps each of these in a `tokio::time::interval` loop; kept separate so
//! a tick is a plain, testable function over `Config` plus whatever
//! in-memory state a worker carries across ticks (conversation history,
//! roller queue, NPC movement map).
//!
//! Grounded on the teacher's split between `core/src/codex.rs`'s
//! submission loop (the scheduling shell) and the pure dispatch it calls
//! into — every function here is the "dispatch" half.

use std::collections::HashMap;

use loom_core::ai::AiProvider;
use loom_core::ai::ChatMessage;
use loom_core::ai::ChatOptions;
use loom_core::ai::ChatRole;
use loom_core::config::Config;
use loom_core::effects::apply_effects;
use loom_core::effects::parse_machine_text;
use loom_core::effects::Command;
use loom_core::effects::Value;
use loom_core::envelope;
use loom_core::metrics::MetricsSink;
use loom_core::npc;
use loom_core::npc::ConversationPresence;
use loom_core::npc::MovementState;
use loom_core::npc::NpcCommand;
use loom_core::npc::ReassessmentPolicy;
use loom_core::npc::ReassessmentScheduler;
use loom_core::renderer;
use loom_core::renderer::ConversationHistory;
use loom_core::resolve::parse_ref;
use loom_core::resolve::resolve_strict;
use loom_core::roller::RollRequest;
use loom_core::roller::RollerAction;
use loom_core::roller::RollerState;
use loom_core::router::route;
use loom_core::router::RouteDecision;
use loom_core::session::SessionFence;
use loom_core::store::CapPolicy;
use loom_core::store::Store;
use loom_core::world::TilePos;
use loom_protocol::Envelope;
use loom_protocol::EnvelopeBuilder;
use loom_protocol::QueueFile;
use loom_protocol::Stage;
use loom_protocol::Status;

use crate::state::WorldAdapter;
use crate::state::WorldState;
use crate::state::WorldStore;

fn log_store(cfg: &Config) -> Store {
    Store::new(cfg.log_path(), CapPolicy { max: cfg.log_cap })
}

fn outbox_store(cfg: &Config) -> Store {
    Store::new(cfg.outbox_path(), CapPolicy { max: cfg.outbox_cap })
}

fn inbox_store(cfg: &Config) -> Store {
    Store::new(cfg.inbox_path(), CapPolicy { max: cfg.inbox_cap })
}

/// Appends `env` to the Log and, via an immediate router pass, fans it
/// out to the Outbox. Every worker's only write path into the bus.
pub fn publish(cfg: &Config, env: Envelope) -> loom_core::Result<()> {
    log_store(cfg).append_deduped(env.clone())?;
    match route(&env) {
        RouteDecision::ToOutbox { status } => {
            let mut out = env;
            out.status = status;
            outbox_store(cfg).append_deduped(out)?;
        }
        RouteDecision::LogOnly => {}
    }
    Ok(())
}

/// Router tick (C4): fans any not-yet-routed Log entry out to the Outbox.
/// "Not yet routed" is tracked with a `routed` flag in `meta.ext` since
/// the wire envelope carries no separate routing-state field.
pub fn router_tick(cfg: &Config, session: &SessionFence) -> loom_core::Result<usize> {
    let log = log_store(cfg);
    let outbox = outbox_store(cfg);
    let mut file = log.read()?;
    let mut routed = 0usize;

    for env in file.messages.iter_mut() {
        if !session.is_current_session(env) {
            continue;
        }
        let already_routed = env
            .meta
            .ext
            .get("routed")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if already_routed {
            continue;
        }
        if let RouteDecision::ToOutbox { status } = route(env) {
            let mut out_env = env.clone();
            out_env.status = status;
            outbox.append_deduped(out_env)?;
        }
        env.meta.ext.insert("routed".to_string(), serde_json::Value::Bool(true));
        routed += 1;
    }

    if routed > 0 {
        log.write(&file)?;
    }
    Ok(routed)
}

/// State applier tick (C8): claims `ruling_*` / `pending_state_apply`
/// envelopes, applies their effects to world state, and emits one
/// `applied_1` successor per input (spec.md §4.8).
pub async fn apply_tick(
    cfg: &Config,
    session: &SessionFence,
    world_store: &WorldStore,
) -> loom_core::Result<usize> {
    let outbox = outbox_store(cfg);
    let mut file = outbox.read()?;
    let mut claimed = Vec::new();

    for env in file.messages.iter_mut() {
        if !session.is_current_session(env) {
            continue;
        }
        if env.stage.starts_with("ruling_") && env.status == Status::PendingStateApply {
            env.status = Status::Processing;
            claimed.push(env.clone());
        }
    }
    if !claimed.is_empty() {
        outbox.write(&file)?;
    }

    let mut applied = 0usize;
    let mut world = world_store.load()?;
    let mut successors = Vec::new();

    for mut input in claimed {
        let effects_text = input.meta.effects.clone().unwrap_or_default();
        let outcome = apply_effects_text(&mut world, &effects_text);
        match outcome {
            Ok(count) => {
                input.status = Status::Done;
                input.meta.effects_applied = Some(count);
                let successor = envelope::new(
                    EnvelopeBuilder {
                        sender: "state_applier".to_string(),
                        content: input.content.clone(),
                        stage: Some(Stage::new("applied", 1)),
                        status: Some(Status::Sent),
                        correlation_id: Some(input.correlation_id.clone()),
                        conversation_id: input.conversation_id.clone(),
                        meta: loom_protocol::Meta {
                            effects: Some(effects_text),
                            effects_applied: Some(count),
                            action_verb: input.meta.action_verb.clone(),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                    next_log_index(cfg)?,
                    Some(&session.session_id()),
                );
                successors.push(successor);
                applied += 1;
            }
            Err(reason) => {
                input.status = Status::Error;
                tracing::warn!(reason, id = %input.id, "state applier failed to apply effects");
            }
        }
        outbox_store(cfg).update(input)?;
    }

    if applied > 0 {
        world_store.save(&world)?;
    }
    for successor in successors {
        publish(cfg, successor)?;
    }
    Ok(applied)
}

/// Applies `effects_text` to `world`, returning the count of commands
/// parsed and dispatched (individual command failures are warnings, per
/// spec.md §4.8 step 3, and do not fail the whole batch).
fn apply_effects_text(world: &mut WorldState, effects_text: &str) -> Result<u32, String> {
    let commands: Vec<Command> = parse_machine_text(effects_text).map_err(|e| e.to_string())?;
    if commands.is_empty() {
        return Ok(0);
    }
    let raw_refs = collect_ref_args(&commands);
    let mut adapter = WorldAdapter::new(world);
    let resolved = resolve_strict(&raw_refs, &adapter).map_err(|e| e.to_string())?;
    let result = apply_effects(&commands, &resolved, &mut adapter);
    for warning in &result.warnings {
        tracing::warn!(warning, "effect application warning");
    }
    Ok(result.effects_applied)
}

fn collect_ref_args(commands: &[Command]) -> Vec<String> {
    let mut refs = Vec::new();
    for cmd in commands {
        for (_, value) in &cmd.args {
            if let Value::Ident(s) = value {
                if parse_ref(s).is_some() {
                    refs.push(s.clone());
                }
            }
        }
    }
    refs
}

/// Renderer tick (C10). `history` and `ai` are owned by the calling loop
/// across ticks; `ai_timeout`/`model` come from process config.
pub async fn render_tick(
    cfg: &Config,
    session: &SessionFence,
    history: &mut ConversationHistory,
    ai: &dyn AiProvider,
    model: &str,
) -> loom_core::Result<usize> {
    let outbox = outbox_store(cfg);
    let mut file = outbox.read()?;
    let mut claimed = Vec::new();

    for env in file.messages.iter_mut() {
        if !session.is_current_session(env) {
            continue;
        }
        if renderer::should_claim(env) {
            env.status = Status::Processing;
            claimed.push(env.clone());
        }
    }
    if !claimed.is_empty() {
        outbox.write(&file)?;
    }

    let mut rendered = 0usize;
    for source in claimed {
        let prompt = renderer::build_prompt(&source, history);
        let messages = vec![
            ChatMessage {
                role: ChatRole::System,
                content: "You narrate a tabletop scene in second person, briefly.".to_string(),
            },
            ChatMessage {
                role: ChatRole::User,
                content: prompt,
            },
        ];
        let opts = ChatOptions {
            model: model.to_string(),
            timeout: cfg.renderer_timeout,
        };
        let raw = match ai.chat(&messages, &opts).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "renderer ai call failed, falling back to empty narration");
                String::new()
            }
        };

        let outcome = renderer::finalize(source, &raw, next_log_index(cfg)?, Some(&session.session_id()));
        history.push(outcome.history_entry);
        outbox_store(cfg).update(outcome.updated_source)?;
        publish(cfg, outcome.rendered_envelope)?;
        rendered += 1;
    }
    Ok(rendered)
}

/// Roller tick (C9). `state` is the in-memory pending-roll queue owned by
/// the calling loop; the status file mirrors it for the UI on every tick.
pub fn roller_tick(cfg: &Config, session: &SessionFence, state: &mut RollerState) -> loom_core::Result<usize> {
    let outbox = outbox_store(cfg);
    let mut file = outbox.read()?;
    let mut claimed = Vec::new();

    for env in file.messages.iter_mut() {
        if !session.is_current_session(env) {
            continue;
        }
        let is_roll = env.stage.starts_with("roll_request") || env.stage.starts_with("roll_input");
        if is_roll && matches!(env.status, Status::Sent | Status::Queued) {
            env.status = Status::Processing;
            claimed.push(env.clone());
        }
    }
    if !claimed.is_empty() {
        outbox.write(&file)?;
    }

    let mut resolved_count = 0usize;
    for input in claimed {
        let action = if input.stage.starts_with("roll_request") {
            let request = RollRequest {
                roll_id: input.meta.roll_id.clone().unwrap_or_else(|| input.id.clone()),
                dice_label: input.content.clone(),
                expression: input.content.clone(),
                rolled_by_player: input.meta.rolled_by_player.unwrap_or(false),
            };
            state.handle_roll_request(request, roll_die)
        } else {
            let roll_id = input.meta.roll_id.clone().unwrap_or_default();
            state.handle_roll_input(&roll_id, roll_die)
        };

        let mut done_input = input;
        done_input.status = Status::Done;
        outbox_store(cfg).update(done_input.clone())?;

        if let Err(e) = &action {
            tracing::warn!(error = %e, id = %done_input.id, "roller failed to evaluate dice expression");
        }
        if let Ok(RollerAction::Resolved(result)) = action {
            let successor = envelope::new(
                EnvelopeBuilder {
                    sender: "roller".to_string(),
                    content: format!("total={} base={} faces={:?}", result.total, result.base, result.faces),
                    stage: Some(Stage::new("roll_result", 1)),
                    status: Some(Status::Sent),
                    correlation_id: Some(done_input.correlation_id.clone()),
                    conversation_id: done_input.conversation_id.clone(),
                    meta: loom_protocol::Meta {
                        roll_id: Some(result.roll_id),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                next_log_index(cfg)?,
                Some(&session.session_id()),
            );
            publish(cfg, successor)?;
            resolved_count += 1;
        }
    }

    let status_json = serde_json::to_vec_pretty(&state.status(envelope::iso8601_now()))
        .map_err(loom_core::CoreError::from)?;
    write_status_file(&cfg.roller_status_path(), &status_json)?;
    Ok(resolved_count)
}

fn roll_die(sides: u32) -> u32 {
    use rand::Rng;
    rand::rng().random_range(1..=sides.max(1))
}

fn write_status_file(path: &std::path::Path, bytes: &[u8]) -> loom_core::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| loom_core::CoreError::Io {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    let tmp = path.with_file_name(format!(
        ".{}.tmp",
        path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    ));
    std::fs::write(&tmp, bytes).map_err(|e| loom_core::CoreError::Io {
        path: tmp.display().to_string(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| loom_core::CoreError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// NPC movement controller tick (C11). `movement`/`presence`/`scheduler`
/// are owned by the calling loop so goals and paths survive across ticks.
pub fn npc_tick(
    cfg: &Config,
    world_store: &WorldStore,
    movement: &mut HashMap<String, MovementState>,
    presence: &mut ConversationPresence,
    scheduler: &mut ReassessmentScheduler,
    now_ms: i64,
) -> loom_core::Result<Vec<NpcCommand>> {
    let mut world = world_store.load()?;
    let policy = ReassessmentPolicy::default();
    let mut commands = Vec::new();

    let npc_ids: Vec<String> = world.npcs.keys().cloned().collect();
    for id in &npc_ids {
        let npc_ref = format!("npc.{id}");
        let Some(record) = world.npcs.get(id) else { continue };
        let Some(loc) = &record.location else { continue };
        movement
            .entry(npc_ref.clone())
            .or_insert_with(|| MovementState::new(loc.tile, now_ms));

        if presence.is_in_conversation_presence(&npc_ref, now_ms).is_some() {
            commands.push(NpcCommand::Status {
                npc_ref: npc_ref.clone(),
                text: "busy".to_string(),
            });
        }
    }

    let candidates: Vec<String> = movement.keys().cloned().collect();
    let batch = cfg.npc_reassess_batch;
    let picked: Vec<String> = scheduler
        .select(&candidates, batch)
        .into_iter()
        .map(str::to_string)
        .collect();

    for npc_ref in &picked {
        let jitter_ms = rand_jitter(policy.jitter_max_ms);
        let Some(state) = movement.get(npc_ref) else { continue };
        if !npc::needs_reassessment(state, now_ms, &policy, jitter_ms) {
            continue;
        }
        let Some(id) = npc_ref.strip_prefix("npc.") else { continue };
        let Some(record) = world.npcs.get(id) else { continue };
        let Some(loc) = &record.location else { continue };
        let Some(place_id) = &loc.place_id else { continue };
        let Some(place) = world.places.get(place_id) else { continue };

        let goal_tile = wander_tile(place.tile_grid.width, place.tile_grid.height);
        let path = npc::find_path_to_nearby(place, loc.tile, goal_tile, npc_ref, 5);

        if let Some(state) = movement.get_mut(npc_ref) {
            state.last_reassess_time_ms = now_ms;
            state.blocked_since_ms = None;
            state.stuck_count = 0;
            match path {
                Some(p) => {
                    state.path = p;
                    state.path_index = 0;
                    state.is_moving = true;
                    commands.push(NpcCommand::Wander { npc_ref: npc_ref.clone() });
                }
                None => {
                    state.is_moving = false;
                    commands.push(NpcCommand::Stop { npc_ref: npc_ref.clone() });
                }
            }
        }
    }

    for npc_ref in &picked {
        let Some(id) = npc_ref.strip_prefix("npc.") else { continue };
        let Some(state) = movement.get_mut(npc_ref) else { continue };
        if !state.is_moving || state.path.is_empty() {
            continue;
        }
        let next_index = state.path_index + 1;
        if next_index >= state.path.len() {
            state.is_moving = false;
            continue;
        }
        let from = state.path[state.path_index];
        let to = state.path[next_index];

        let place = world
            .npcs
            .get(id)
            .and_then(|r| r.location.as_ref())
            .and_then(|loc| loc.place_id.as_ref())
            .and_then(|place_id| world.places.get(place_id));
        let tile_free = place.is_none_or(|p| p.is_tile_free(to, Some(id)));

        let Some(state) = movement.get_mut(npc_ref) else { continue };
        if !tile_free {
            if state.blocked_since_ms.is_none() {
                state.blocked_since_ms = Some(now_ms);
            }
            state.stuck_count += 1;
            continue;
        }

        state.blocked_since_ms = None;
        state.stuck_count = 0;
        state.path_index = next_index;
        state.record_position(to);
        if let Some(facing) = npc::facing_from_delta(to.x - from.x, to.y - from.y) {
            commands.push(NpcCommand::Face {
                npc_ref: npc_ref.clone(),
                facing,
            });
        }
        commands.push(NpcCommand::Move {
            npc_ref: npc_ref.clone(),
            to,
        });
        if let Some(record) = world.npcs.get_mut(id) {
            if let Some(loc) = &mut record.location {
                loc.tile = to;
            }
        }
    }

    world_store.save(&world)?;
    Ok(commands)
}

fn wander_tile(width: u32, height: u32) -> TilePos {
    use rand::Rng;
    let mut rng = rand::rng();
    TilePos::new(
        rng.random_range(0..width.max(1) as i32),
        rng.random_range(0..height.max(1) as i32),
    )
}

fn rand_jitter(max_ms: i64) -> i64 {
    use rand::Rng;
    if max_ms <= 0 {
        0
    } else {
        rand::rng().random_range(0..=max_ms)
    }
}

/// Recovery sweep (SPEC_FULL.md §5 / spec.md §7): promotes stale
/// `processing` entries across all three queues back to `sent`.
pub fn recover_tick(cfg: &Config, metrics: &MetricsSink) -> loom_core::Result<usize> {
    let mut recovered = 0usize;
    recovered += log_store(cfg).recover_stale_processing(cfg.stale_processing_secs)?;
    recovered += inbox_store(cfg).recover_stale_processing(cfg.stale_processing_secs)?;
    recovered += outbox_store(cfg).recover_stale_processing(cfg.stale_processing_secs)?;
    if recovered > 0 {
        metrics.increment("stale_processing_recovered", recovered as u64)?;
    }
    Ok(recovered)
}

pub fn next_log_index(cfg: &Config) -> loom_core::Result<u32> {
    let file: QueueFile = log_store(cfg).read()?;
    Ok(envelope::next_index(&file.messages))
}
