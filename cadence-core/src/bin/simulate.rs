//! Headless scenario runner.
//!
//! Replays a JSON scenario (mode changes, voice activity, fragments, steps…)
//! against a `CadenceEngine` on a simulated clock at a fixed frame rate and
//! prints a JSON summary.
//!
//! ```text
//! cargo run -p cadence-core --bin simulate -- --scenario demo.json [--output out.json]
//! ```

use std::path::{Path, PathBuf};

use cadence_core::{
    AlignmentSample, CadenceEngine, CadenceError, Clock, EngineConfig, LineLayout, ManualClock,
    MatcherEvent, MemorySurface, ModeChangedEvent, Result, Script, ScrollMode, ScrollTarget,
    StepCommand,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Args {
    scenario: PathBuf,
    output: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Scenario {
    #[serde(default)]
    config: EngineConfig,
    initial_mode: ScrollMode,
    #[serde(default)]
    script: String,
    #[serde(default = "default_viewport")]
    viewport_height: f64,
    #[serde(default = "default_content")]
    content_height: f64,
    /// Uniform line layout; omitted means the engine's fallback geometry.
    line_height: Option<f64>,
    duration_ms: u64,
    #[serde(default = "default_frame_ms")]
    frame_ms: u64,
    #[serde(default)]
    events: Vec<ScenarioEvent>,
}

fn default_viewport() -> f64 {
    600.0
}

fn default_content() -> f64 {
    10_000.0
}

fn default_frame_ms() -> u64 {
    16
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioEvent {
    at_ms: u64,
    #[serde(flatten)]
    action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Action {
    Mode {
        mode: ScrollMode,
    },
    Voice {
        active: bool,
    },
    Pacing {
        wpm: f64,
    },
    #[serde(rename_all = "camelCase")]
    Fragment {
        text: String,
        #[serde(default)]
        is_final: bool,
        #[serde(default = "full_confidence")]
        confidence: f64,
    },
    Sample {
        error: f64,
        confidence: f64,
    },
    ManualSpeed {
        speed: f64,
    },
    Nudge {
        delta: f64,
    },
    Lines {
        count: i32,
    },
    Pages {
        count: i32,
    },
    Jump {
        line: usize,
    },
    /// The presenter drags the view to `offset`.
    UserScroll {
        offset: f64,
    },
}

fn full_confidence() -> f64 {
    1.0
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    scenario: String,
    frames: u64,
    duration_ms: u64,
    final_mode: Option<ScrollMode>,
    final_scroll_top: f64,
    final_velocity: f64,
    max_velocity: f64,
    final_line: usize,
    physical_writes: u64,
    coalesced_requests: u64,
    commits: u32,
    rescues: u32,
    stats_reports: u32,
    mode_changes: Vec<ModeChangedEvent>,
}

fn parse_args() -> std::result::Result<Args, String> {
    let mut scenario: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--scenario" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --scenario".into());
                };
                scenario = Some(PathBuf::from(v));
            }
            "--output" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                output = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p cadence-core --bin simulate -- \\
  --scenario <file.json> [--output <summary.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let scenario = scenario.ok_or_else(|| "--scenario is required".to_string())?;
    Ok(Args { scenario, output })
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    let raw = std::fs::read_to_string(path)?;
    let mut scenario: Scenario = serde_json::from_str(&raw)?;
    scenario.config.normalize();
    scenario.config.validate()?;
    if scenario.frame_ms == 0 {
        return Err(CadenceError::InvalidConfig {
            field: "frameMs",
            reason: "must be greater than zero".into(),
        });
    }
    if scenario.initial_mode.uses_matcher() && scenario.script.trim().is_empty() {
        return Err(CadenceError::EmptyScript);
    }
    scenario.events.sort_by_key(|e| e.at_ms);
    Ok(scenario)
}

fn apply(engine: &mut CadenceEngine, surface: &MemorySurface, clock: &ManualClock, action: Action) {
    debug!(?action, at_ms = clock.now_ms(), "scenario event");
    match action {
        Action::Mode { mode } => {
            engine.set_mode(mode);
        }
        Action::Voice { active } => engine.on_voice_activity(active),
        Action::Pacing { wpm } => engine.on_pacing_estimate(wpm),
        Action::Fragment {
            text,
            is_final,
            confidence,
        } => {
            engine.on_fragment(&text, is_final, confidence);
        }
        Action::Sample { error, confidence } => {
            engine.on_speech_sample(AlignmentSample::new(error, confidence, clock.now_ms()));
        }
        Action::ManualSpeed { speed } => engine.set_manual_speed(speed),
        Action::Nudge { delta } => engine.nudge_speed(delta),
        Action::Lines { count } => {
            engine.step(StepCommand::Line(count));
        }
        Action::Pages { count } => {
            engine.step(StepCommand::Page(count));
        }
        Action::Jump { line } => {
            engine.jump_to(ScrollTarget::Line(line));
        }
        Action::UserScroll { offset } => {
            surface.user_scroll_to(offset);
            engine.on_user_scroll();
        }
    }
}

fn run(args: &Args) -> Result<Summary> {
    let scenario = load_scenario(&args.scenario)?;
    let clock = ManualClock::new(0);
    let surface = MemorySurface::new(scenario.viewport_height, scenario.content_height);
    let script = Script::from_text(&scenario.script);
    let line_count = script.len();

    let mut engine = CadenceEngine::new(scenario.config, scenario.initial_mode, clock.clone());
    engine.attach_surface(surface.clone());
    engine.set_script(script);
    if let Some(line_height) = scenario.line_height {
        engine.set_line_layout(LineLayout::uniform(line_count, line_height));
    }

    let mut modes = engine.subscribe_modes();
    let mut matcher_events = engine.subscribe_matcher();

    info!(
        scenario = %args.scenario.display(),
        mode = %scenario.initial_mode,
        lines = line_count,
        duration_ms = scenario.duration_ms,
        "running scenario"
    );

    let mut summary = Summary {
        scenario: args.scenario.display().to_string(),
        duration_ms: scenario.duration_ms,
        ..Summary::default()
    };
    let mut events = scenario.events.into_iter().peekable();

    while clock.now_ms() < scenario.duration_ms {
        let now = clock.advance(scenario.frame_ms);
        while let Some(event) = events.next_if(|e| e.at_ms <= now) {
            apply(&mut engine, &surface, &clock, event.action);
        }

        let report = engine.frame();
        summary.frames += 1;
        summary.max_velocity = summary.max_velocity.max(report.velocity);

        while let Ok(event) = matcher_events.try_recv() {
            match event {
                MatcherEvent::Commit(_) => summary.commits += 1,
                MatcherEvent::Rescue(_) => summary.rescues += 1,
                MatcherEvent::Stats(_) => summary.stats_reports += 1,
            }
        }
        while let Ok(event) = modes.try_recv() {
            summary.mode_changes.push(event);
        }
    }

    if events.peek().is_some() {
        warn!("scenario events after durationMs were not applied");
    }

    let counters = engine.scheduler().counters();
    summary.final_mode = Some(engine.mode());
    summary.final_scroll_top = surface.scroll_top();
    summary.final_velocity = engine.velocity();
    summary.final_line = engine.matcher().current_index();
    summary.physical_writes = counters.writes;
    summary.coalesced_requests = counters.coalesced;
    Ok(summary)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let summary = match run(&args) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("simulation failed: {e}");
            std::process::exit(1);
        }
    };

    let rendered = match serde_json::to_string_pretty(&summary) {
        Ok(rendered) => rendered,
        Err(e) => {
            eprintln!("failed to render summary: {e}");
            std::process::exit(1);
        }
    };
    match &args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &rendered) {
                eprintln!("failed to write {}: {e}", path.display());
                std::process::exit(1);
            }
            println!("Summary written to {}", path.display());
        }
        None => println!("{rendered}"),
    }
}
