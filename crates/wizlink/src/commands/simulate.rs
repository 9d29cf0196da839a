//! Scripted run of the peripheral against an in-memory central.
//!
//! Starts the service over the loopback transport, connects a central,
//! applies remote writes and local setter writes, holds the connection
//! for a while, then disconnects and stops. Every observed service
//! state is recorded and printed together with per-channel results.

use std::fmt::Write as _;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tabled::Tabled;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use wizlink_config::Config;
use wizlink_core::{
    ChannelValue, PeripheralService, ServiceConfig, ServiceState, StartOutcome, StateStream,
    StaticPermissions,
};
use wizlink_gatt::{LoopbackCentral, LoopbackTransport};

use crate::cli::{Assignment, GlobalOpts, OutputFormat, SimulateArgs};
use crate::error::CliError;
use crate::log_buffer::{LogBuffer, LogEntry};
use crate::output;

/// Bound on each scripted step.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Log lines printed by `--show-log`.
const LOG_TAIL: usize = 50;

// ── Report ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Transition {
    elapsed_ms: u64,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<Vec<ChannelValue>>,
}

impl Transition {
    fn observe(started: Instant, state: &ServiceState) -> Self {
        Self {
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            state: state.label(),
            values: state.snapshot().map(|s| s.values().to_vec()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChannelResult {
    name: String,
    uuid: Uuid,
    /// Value the central holds when the run ends.
    central_value: Option<i32>,
    notifications: usize,
}

#[derive(Debug, Serialize)]
struct Report {
    transitions: Vec<Transition>,
    channels: Vec<ChannelResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<Vec<LogEntry>>,
}

// ── Table rows ──────────────────────────────────────────────────────

#[derive(Tabled)]
struct TransitionRow {
    #[tabled(rename = "+ms")]
    elapsed: u64,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Values")]
    values: String,
}

#[derive(Tabled)]
struct ChannelResultRow {
    #[tabled(rename = "Channel")]
    name: String,
    #[tabled(rename = "Central Value")]
    value: String,
    #[tabled(rename = "Notifications")]
    notifications: usize,
}

fn detail(report: &Report, color: bool) -> String {
    let transitions: Vec<TransitionRow> = report
        .transitions
        .iter()
        .map(|t| TransitionRow {
            elapsed: t.elapsed_ms,
            state: output::paint_state(t.state, color),
            values: t.values.as_ref().map_or_else(String::new, |values| {
                values
                    .iter()
                    .map(|v| format!("{}={}", v.name, v.value))
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
        })
        .collect();
    let channels: Vec<ChannelResultRow> = report
        .channels
        .iter()
        .map(|c| ChannelResultRow {
            name: c.name.clone(),
            value: c.central_value.map(|v| v.to_string()).unwrap_or_default(),
            notifications: c.notifications,
        })
        .collect();

    let mut out = String::new();
    let _ = writeln!(out, "{}", output::render_table(&transitions));
    let _ = write!(out, "{}", output::render_table(&channels));
    if let Some(ref log) = report.log {
        let _ = write!(out, "\n\nLog ({} entries):", log.len());
        for entry in log {
            let _ = write!(out, "\n  {entry}");
        }
    }
    out
}

fn plain(report: &Report) -> String {
    report
        .channels
        .iter()
        .map(|c| {
            format!(
                "{}={}",
                c.name,
                c.central_value.map(|v| v.to_string()).unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn within<T>(step: &str, fut: impl Future<Output = T>) -> Result<T, CliError> {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .map_err(|_| CliError::Timeout {
            step: step.into(),
            seconds: STEP_TIMEOUT.as_secs(),
        })
}

/// Wait for a state matching `predicate`; a closed stream is a stopped service.
async fn reach(
    state: &mut StateStream,
    step: &str,
    predicate: impl FnMut(&ServiceState) -> bool,
) -> Result<ServiceState, CliError> {
    within(step, state.wait_for(predicate))
        .await?
        .ok_or(CliError::Core(wizlink_core::CoreError::Stopped))
}

/// Reject assignments naming channels that do not exist.
fn check_assignments(config: &ServiceConfig, args: &SimulateArgs) -> Result<(), CliError> {
    for a in args.set.iter().chain(&args.local) {
        if config.channel(&a.channel).is_none() {
            return Err(CliError::NotFound {
                resource_type: "channel".into(),
                identifier: a.channel.clone(),
                list_command: "channels".into(),
            });
        }
    }
    Ok(())
}

/// Record every state the service passes through until `done` fires.
fn spawn_recorder(
    mut state: StateStream,
    started: Instant,
    mut done: oneshot::Receiver<()>,
) -> JoinHandle<Vec<Transition>> {
    tokio::spawn(async move {
        let mut seen = vec![Transition::observe(started, &state.latest())];
        loop {
            tokio::select! {
                biased;
                next = state.changed() => match next {
                    Some(s) => seen.push(Transition::observe(started, &s)),
                    None => break,
                },
                _ = &mut done => break,
            }
        }
        seen
    })
}

fn collect_results(config: &ServiceConfig, central: &LoopbackCentral) -> Vec<ChannelResult> {
    config
        .channels
        .iter()
        .map(|c| ChannelResult {
            name: c.name.clone(),
            uuid: c.uuid,
            central_value: central
                .characteristic(c.uuid)
                .and_then(|ch| c.width.decode(&ch.value()).ok()),
            notifications: central.notify_count(c.uuid),
        })
        .collect()
}

// ── Script ──────────────────────────────────────────────────────────

/// Drive a started service through one connection.
async fn script(
    service: &PeripheralService<LoopbackTransport>,
    args: &SimulateArgs,
) -> Result<Vec<ChannelResult>, CliError> {
    let config = service.config();
    let mut state = service.state();

    reach(&mut state, "the server to start", |s| {
        *s == ServiceState::WaitingForConnection
    })
    .await?;
    let server = within("the GATT server", service.transport().wait_for_server()).await??;

    for channel in &config.channels {
        server.preset_value(channel.uuid, channel.width.encode(args.initial));
    }
    let central = server.connect()?;
    info!(connection = %central.id(), "central connected");
    reach(&mut state, "the first snapshot", ServiceState::is_connected).await?;

    for Assignment { channel, value } in &args.set {
        let Some(spec) = config.channel(channel) else {
            continue;
        };
        central.write_int(spec.uuid, spec.width, *value)?;
        let expected = spec.width.clamp(*value);
        debug!(channel = %channel, value = expected, "remote write");
        reach(&mut state, &format!("{channel} to become {expected}"), |s| {
            s.snapshot().and_then(|snap| snap.get(channel)) == Some(expected)
        })
        .await?;
    }

    for Assignment { channel, value } in &args.local {
        let current = state.current();
        let Some(setter) = current.snapshot().and_then(|snap| snap.setter(channel)) else {
            continue;
        };
        setter.set(*value);
        let expected = config
            .channel(channel)
            .map_or(*value, |spec| spec.width.clamp(*value));
        debug!(channel = %channel, value = expected, "local write");
        reach(&mut state, &format!("{channel} to become {expected}"), |s| {
            s.snapshot().and_then(|snap| snap.get(channel)) == Some(expected)
        })
        .await?;
    }

    tokio::time::sleep(args.hold).await;
    let results = collect_results(config, &central);

    central.disconnect();
    info!("central disconnected");
    reach(&mut state, "the disconnect", |s| {
        *s == ServiceState::WaitingForConnection
    })
    .await?;
    Ok(results)
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(
    args: &SimulateArgs,
    config: &Config,
    global: &GlobalOpts,
    logs: &LogBuffer,
) -> Result<(), CliError> {
    let service_config = config.to_service_config()?;
    check_assignments(&service_config, args)?;

    let service = PeripheralService::new(service_config, LoopbackTransport::new())?;
    let permissions: StaticPermissions = args.deny.iter().copied().collect();

    let started = Instant::now();
    let (done_tx, done_rx) = oneshot::channel();
    let recorder = spawn_recorder(service.state(), started, done_rx);

    if let StartOutcome::PermissionRequired(missing) = service.start(&permissions).await? {
        let _ = done_tx.send(());
        let _ = recorder.await;
        return Err(CliError::PermissionRequired { missing });
    }

    let outcome = script(&service, args).await;
    service.stop().await;
    let _ = done_tx.send(());
    let transitions = recorder.await.unwrap_or_default();
    let channels = outcome?;

    let report = Report {
        transitions,
        channels,
        log: args.show_log.then(|| logs.tail(LOG_TAIL)),
    };
    let color = output::should_color(&global.color);
    let out = output::render_single(
        &global.output,
        &report,
        |r| detail(r, color),
        plain,
    )?;
    output::print_output(&out, global.quiet);

    if args.show_log && logs.is_empty() && matches!(global.output, OutputFormat::Table) {
        eprintln!("(log buffer is empty)");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn args(set: &[&str], local: &[&str]) -> SimulateArgs {
        SimulateArgs {
            set: set.iter().map(|s| Assignment::from_str(s).unwrap()).collect(),
            local: local
                .iter()
                .map(|s| Assignment::from_str(s).unwrap())
                .collect(),
            initial: 5,
            hold: Duration::from_millis(1500),
            deny: Vec::new(),
            show_log: false,
        }
    }

    async fn run_script(args: &SimulateArgs) -> (Vec<ChannelResult>, Vec<Transition>) {
        let service =
            PeripheralService::new(ServiceConfig::default(), LoopbackTransport::new()).unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        let recorder = spawn_recorder(service.state(), Instant::now(), done_rx);

        service
            .start(&StaticPermissions::all_granted())
            .await
            .unwrap();
        let results = script(&service, args).await.unwrap();
        service.stop().await;
        done_tx.send(()).unwrap();
        (results, recorder.await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn remote_and_local_writes_reach_the_central() {
        let (results, transitions) = run_script(&args(&["data2=99"], &["data3=-4"])).await;

        let values: Vec<_> = results.iter().map(|r| r.central_value).collect();
        assert_eq!(values, [Some(5), Some(99), Some(-4)]);
        assert!(results.iter().all(|r| r.notifications > 0));

        let labels: Vec<_> = transitions.iter().map(|t| t.state).collect();
        assert_eq!(labels.first(), Some(&"not started"));
        assert_eq!(labels.last(), Some(&"not started"));
        assert!(labels.contains(&"connected"));
        assert!(labels.contains(&"waiting for connection"));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_values_seed_the_first_snapshot() {
        let (_, transitions) = run_script(&args(&[], &[])).await;
        let first_connected = transitions
            .iter()
            .find_map(|t| t.values.as_ref())
            .unwrap();
        assert!(first_connected.iter().all(|v| v.value == 5));
    }

    #[test]
    fn unknown_channels_are_rejected_up_front() {
        let err = check_assignments(&ServiceConfig::default(), &args(&["nope=1"], &[]))
            .unwrap_err();
        assert!(matches!(err, CliError::NotFound { ref identifier, .. } if identifier == "nope"));
    }

    #[test]
    fn plain_output_lists_final_values() {
        let report = Report {
            transitions: Vec::new(),
            channels: vec![ChannelResult {
                name: "data1".into(),
                uuid: Uuid::nil(),
                central_value: Some(3),
                notifications: 1,
            }],
            log: None,
        };
        assert_eq!(plain(&report), "data1=3");
        assert!(detail(&report, false).contains("Notifications"));
    }
}
