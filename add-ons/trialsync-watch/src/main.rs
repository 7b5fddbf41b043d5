//! trialsync: trial watcher for the companion client.
//!
//! trialsync            same as `watch`
//! trialsync watch      poll the session, run the countdown, re-apply the access gate until CTRL-C
//! trialsync start      start a trial once and exit
//! trialsync status     cached trial and gate decisions

use std::io::Write;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trialsync_core::countdown::INVALID_DATE_LABEL;
use trialsync_core::{
    AccessGate, BackendClient, Clock, ColorBand, Countdown, CountdownFrame, CountdownHandle,
    CountdownRenderer, CountdownTimer, EventBus, GateRegistry, MemorySurface, RequiredTier,
    SledStore, StartOutcome, SyncOutcome, SystemClock, TrialEvent, TrialSessionController,
    TrialState, TrialStore, TrialSyncConfig,
};

const BAR_WIDTH: usize = 24;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[trialsync] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match TrialSyncConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid trialsync configuration");
            std::process::exit(2);
        }
    };

    let backend = match SledStore::open(Some(&config.storage_path)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, path = %config.storage_path, "cannot open trial store");
            std::process::exit(2);
        }
    };
    let store = Arc::new(TrialStore::new(Arc::new(backend)));
    let client = BackendClient::with_timeout(
        config.api_base_url.clone(),
        config.auth_token.clone(),
        config.request_timeout(),
    );
    let controller = Arc::new(
        TrialSessionController::new(client, store, EventBus::new())
            .with_fallback_duration(config.fallback_duration()),
    );

    let args: Vec<String> = std::env::args().collect();
    let sub = args.get(1).map(|s| s.as_str()).unwrap_or("watch");
    match sub {
        "start" => start(&config, &controller).await,
        "status" => status(&config, &controller).await,
        "watch" => watch(&config, controller).await,
        other => {
            eprintln!("unknown command: {} (expected watch, start or status)", other);
            std::process::exit(2);
        }
    }
}

async fn start(config: &TrialSyncConfig, ctl: &TrialSessionController) {
    ctl.restore();
    match ctl.start_trial().await {
        StartOutcome::Started(state) => println!(
            "Trial started: {} limits until {}",
            config.tier_name(state.plan_limits_from),
            state.expires_at
        ),
        StartOutcome::Ignored(phase) => println!("Trial not started (currently {:?})", phase),
        StartOutcome::Failed(message) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
    }
}

async fn status(config: &TrialSyncConfig, ctl: &TrialSessionController) {
    match ctl.restore() {
        Some(state) => {
            let frame = Countdown::for_trial(&state).frame_at(SystemClock.now());
            println!(
                "Trial active: {} remaining ({} limits)",
                frame.label(),
                config.tier_name(state.plan_limits_from)
            );
        }
        None => println!("No active trial"),
    }

    let registry = config.registry();
    if registry.is_empty() {
        return;
    }
    match ctl.refresh_access().await {
        Ok(snapshot) => {
            let gate = AccessGate::new(config.referral_trial_policy);
            println!(
                "Plan: {}{}",
                config.tier_name(snapshot.tier),
                if snapshot.trial_active { " (trial)" } else { "" }
            );
            for (id, decision) in gate.evaluate(&registry, &snapshot) {
                println!(
                    "  {:<24} {:<8} requires {}",
                    id,
                    if decision.unlocked { "unlocked" } else { "locked" },
                    requirement_label(config, decision.required)
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "could not fetch user plan"),
    }
}

async fn watch(config: &TrialSyncConfig, ctl: Arc<TrialSessionController>) {
    let registry = config.registry();
    let gate = AccessGate::new(config.referral_trial_policy);
    let mut surface = MemorySurface::new();
    let mut events = ctl.events().subscribe();
    let mut running: Option<(TrialState, CountdownHandle)> = None;

    if let Some(state) = ctl.restore() {
        let handle = spawn_countdown(config, &ctl, &state);
        running = Some((state, handle));
    }

    tracing::info!(
        version = trialsync_core::version(),
        backend = %config.api_base_url,
        poll_interval_secs = config.poll_interval().as_secs(),
        gated_elements = registry.len(),
        "trialsync watcher started"
    );

    let mut poll = tokio::time::interval(config.poll_interval());

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match ctl.sync_session().await {
                    Ok(SyncOutcome::Active(state)) => {
                        let stale = running
                            .as_ref()
                            .map(|(current, _)| current.expires_at != state.expires_at)
                            .unwrap_or(true);
                        if stale {
                            if let Some((_, handle)) = running.take() {
                                handle.destroy().await;
                            }
                            let handle = spawn_countdown(config, &ctl, &state);
                            running = Some((state, handle));
                        }
                    }
                    Ok(SyncOutcome::Inactive) => {
                        if let Some((_, handle)) = running.take() {
                            handle.destroy().await;
                        }
                    }
                    Ok(SyncOutcome::Skipped) => {}
                    Err(e) => tracing::warn!(error = %e, "session sync failed"),
                }
                refresh_gate(config, &ctl, &gate, &registry, &mut surface).await;
            }
            event = events.recv() => {
                match event {
                    Ok(TrialEvent::Expired) => {
                        running = None;
                        refresh_gate(config, &ctl, &gate, &registry, &mut surface).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "trial events lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down watcher");
                break;
            }
        }
    }

    if let Some((_, handle)) = running.take() {
        handle.destroy().await;
    }
}

fn spawn_countdown(
    config: &TrialSyncConfig,
    ctl: &Arc<TrialSessionController>,
    state: &TrialState,
) -> CountdownHandle {
    let on_expired = {
        let ctl = Arc::clone(ctl);
        move || ctl.on_expired()
    };
    CountdownTimer::new(Countdown::for_trial(state))
        .with_tick(config.tick())
        .with_store(Arc::clone(ctl.store()))
        .with_events(ctl.events().clone())
        .spawn(TerminalRenderer::default(), on_expired)
}

async fn refresh_gate(
    config: &TrialSyncConfig,
    ctl: &TrialSessionController,
    gate: &AccessGate,
    registry: &GateRegistry,
    surface: &mut MemorySurface,
) {
    if registry.is_empty() {
        return;
    }
    match ctl.refresh_access().await {
        Ok(snapshot) => {
            let report = gate.apply(registry, &snapshot, surface);
            tracing::info!(
                tier = config.tier_name(snapshot.tier),
                trial_active = snapshot.trial_active,
                locked = report.locked,
                unlocked = report.unlocked,
                "access gate refreshed"
            );
        }
        Err(e) => tracing::warn!(error = %e, "could not refresh access"),
    }
}

fn requirement_label(config: &TrialSyncConfig, required: RequiredTier) -> &'static str {
    match required {
        RequiredTier::Tier(t) => config.tier_name(t),
        RequiredTier::Referral => "referral",
    }
}

/// One status line on stderr, redrawn in place.
#[derive(Default)]
struct TerminalRenderer {
    band: Option<ColorBand>,
}

impl CountdownRenderer for TerminalRenderer {
    fn render(&mut self, frame: &CountdownFrame) {
        let mut err = std::io::stderr();
        match frame {
            CountdownFrame::Invalid => {
                let _ = writeln!(err, "[trial] {}", INVALID_DATE_LABEL);
            }
            CountdownFrame::Running(d) => {
                if self.band != Some(d.band) {
                    tracing::info!(band = ?d.band, remaining = %d.clock, "trial countdown");
                    self.band = Some(d.band);
                }
                let filled = (((1.0 - d.progress) * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
                let _ = write!(
                    err,
                    "\r[trial] {} [{}{}]",
                    d.clock,
                    "#".repeat(filled),
                    "-".repeat(BAR_WIDTH - filled)
                );
                if d.is_expired() {
                    let _ = writeln!(err);
                }
                let _ = err.flush();
            }
        }
    }
}
