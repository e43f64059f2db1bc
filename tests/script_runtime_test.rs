// Integration tests for the script runtime
//
// These tests verify that:
// 1. Scripts run label by label, jump, fail and exit as written
// 2. Kill is idempotent and cascades through die-with
// 3. Lines reach every interested script (broadcast, not work-stealing)
// 4. Trust gates restricted operations
// 5. Cleanup runs after the script's threads stop, and racing kills agree
// 6. Movement statements wait for the room counter
//
// Scripts talk to an in-memory outlet, so no socket is involved.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stormhub::distribution::Distributor;
use stormhub::parser::{Parser, ParserSettings};
use stormhub::script::{compile, Outlet, Runtime, RuntimeSettings, ScriptLoader, ScriptRegistry};
use stormhub::state::shared_state;
use stormhub::trust::MemoryTrustStore;
use stormhub::{ScriptError, StartOptions};

/// Records everything scripts send and echo.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, String)>>,
    echoes: Mutex<Vec<(String, String)>>,
}

impl Outlet for Recorder {
    fn send_upstream(&self, line: &str, origin: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((line.to_string(), origin.to_string()));
        Ok(())
    }

    fn echo(&self, text: &str, origin: &str) {
        self.echoes.lock().unwrap().push((text.to_string(), origin.to_string()));
    }
}

impl Recorder {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    fn echoed(&self, text: &str, origin: &str) -> bool {
        self.echo_count(text, origin) > 0
    }

    fn echo_count(&self, text: &str, origin: &str) -> usize {
        self.echoes
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, o)| t == text && o == origin)
            .count()
    }
}

fn runtime(trusted: &[&str]) -> (Runtime, Arc<Recorder>) {
    let (rt, recorder, _parser) = runtime_with_parser(trusted);
    (rt, recorder)
}

/// Runtime plus the parser that owns its snapshot, for room changes.
fn runtime_with_parser(trusted: &[&str]) -> (Runtime, Arc<Recorder>, Parser) {
    let recorder = Arc::new(Recorder::default());
    let (writer, state) = shared_state();
    let settings = RuntimeSettings {
        poll_interval: Duration::from_millis(5),
        kill_join_timeout: Duration::from_secs(2),
        move_timeout: Duration::from_millis(200),
        ..RuntimeSettings::default()
    };
    let rt = Runtime::new(
        Arc::new(ScriptRegistry::new()),
        state,
        Arc::clone(&recorder) as Arc<dyn Outlet>,
        Arc::new(MemoryTrustStore::with_names(trusted.iter().copied())),
        ScriptLoader::new(None),
        settings,
    );
    (rt, recorder, Parser::new(writer, ParserSettings::default()))
}

fn start(rt: &Runtime, name: &str, source: &str) -> Result<(), ScriptError> {
    let program = Arc::new(compile(source)?);
    rt.start_program(name, program, Vec::new(), StartOptions::default())
        .map(|_| ())
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

const IDLE: &str = "echo ready\nidle:\n wait\n goto idle\n";

#[test]
fn test_labels_run_in_order_and_goto_skips() {
    let (rt, out) = runtime(&[]);
    start(
        &rt,
        "demo",
        "start:\n put hello\n goto finish\nunused:\n echo never\nfinish:\n echo done\n",
    )
    .unwrap();

    assert!(wait_for(|| out.echoed("--- exited", "demo")));
    assert_eq!(out.sent(), vec![("hello".to_string(), "demo".to_string())]);
    assert!(out.echoed("done", "demo"));
    assert!(!out.echoed("never", "demo"));
    assert!(!rt.exists("demo"));
}

#[test]
fn test_goto_undefined_label_fails_script() {
    let (rt, out) = runtime(&[]);
    start(&rt, "lost", "goto nowhere\necho after\n").unwrap();

    assert!(wait_for(|| out.echoed("--- exited", "lost")));
    assert!(out.echoed("--- undefined-label: undefined label 'nowhere'", "lost"));
    assert!(!out.echoed("after", "lost"));
}

#[test]
fn test_goto_undefined_label_falls_back_to_label_error() {
    let (rt, out) = runtime(&[]);
    start(&rt, "lost", "goto nowhere\nLabelError:\n echo caught\n").unwrap();

    assert!(wait_for(|| out.echoed("--- exited", "lost")));
    assert!(out.echoed("caught", "lost"));
    assert!(out.echoed("label 'nowhere' not found, continuing at LabelError", "lost"));
}

#[test]
fn test_kill_is_idempotent() {
    let (rt, out) = runtime(&[]);
    start(&rt, "idle", IDLE).unwrap();
    assert!(wait_for(|| out.echoed("ready", "idle")));

    let script = rt.registry().find("idle").unwrap();
    assert!(rt.kill("idle"));
    rt.kill_script(&script);
    assert!(!rt.kill("idle"));

    assert!(script.is_killed());
    assert_eq!(out.echo_count("--- exited", "idle"), 1);
    assert!(rt.registry().is_empty());
}

#[test]
fn test_die_with_cascades() {
    let (rt, out) = runtime(&[]);
    start(&rt, "child", IDLE).unwrap();
    start(&rt, "parent", &format!("diewith child\n{IDLE}")).unwrap();
    assert!(wait_for(|| out.echoed("ready", "parent")));

    assert!(rt.kill("parent"));
    assert!(!rt.exists("parent"));
    assert!(!rt.exists("child"));
    assert!(out.echoed("--- exited", "child"));
}

#[test]
fn test_cleanup_runs_after_kill() {
    let (rt, out) = runtime(&[]);
    start(&rt, "camp", &format!("cleanup put stand\n{IDLE}")).unwrap();
    assert!(wait_for(|| out.echoed("ready", "camp")));

    rt.kill("camp");
    assert_eq!(out.sent(), vec![("stand".to_string(), "camp".to_string())]);
}

#[test]
fn test_every_script_receives_each_line() {
    let (rt, out) = runtime(&[]);
    let src = "waitfor ogre\necho saw it\n";
    start(&rt, "one", src).unwrap();
    start(&rt, "two", src).unwrap();

    let delivered = Distributor::new(rt.clone()).distribute(Some("An ogre arrives."), "An ogre arrives.");
    assert_eq!(delivered, 2);
    assert!(wait_for(|| out.echoed("saw it", "one") && out.echoed("saw it", "two")));
}

#[test]
fn test_matchwait_picks_earliest_match() {
    let (rt, out) = runtime(&[]);
    start(
        &rt,
        "paths",
        "match north go north\nmatchre south /go (south)/i\nmatchwait 5\necho timeout\nexit\n\
         north:\n echo N\n exit\nsouth:\n echo S $match1\n exit\n",
    )
    .unwrap();

    Distributor::new(rt.clone()).distribute(Some("You can Go south or go north."), "");
    assert!(wait_for(|| out.echoed("--- exited", "paths")));
    assert!(out.echoed("S south", "paths"));
    assert!(!out.echoed("N", "paths"));
    assert!(!out.echoed("timeout", "paths"));
}

#[test]
fn test_watch_callback_runs_alongside_main_thread() {
    let (rt, out) = runtime(&[]);
    start(&rt, "guard", &format!("watch alarm /ogre/i\n{IDLE}alarm:\n echo spotted\n")).unwrap();
    assert!(wait_for(|| out.echoed("ready", "guard")));

    Distributor::new(rt.clone()).distribute(Some("An OGRE arrives."), "An OGRE arrives.");
    assert!(wait_for(|| out.echoed("spotted", "guard")));
    assert!(rt.exists("guard"));
    rt.kill("guard");
}

#[test]
fn test_paused_script_does_not_consume_lines() {
    let (rt, out) = runtime(&[]);
    start(&rt, "slow", "waitfor go\necho went\n").unwrap();
    assert!(rt.pause("slow"));

    Distributor::new(rt.clone()).distribute(Some("go"), "go");
    thread::sleep(Duration::from_millis(100));
    assert!(!out.echoed("went", "slow"));

    assert!(rt.unpause("slow"));
    assert!(wait_for(|| out.echoed("went", "slow")));
}

#[test]
fn test_duplicate_start_refused_unless_forced() {
    let (rt, out) = runtime(&[]);
    rt.loader().register_source("idle", IDLE);
    let first = rt.start("idle", Vec::new(), StartOptions::default()).unwrap();
    assert!(wait_for(|| out.echoed("ready", "idle")));

    let err = rt.start("IDLE", Vec::new(), StartOptions::default()).unwrap_err();
    assert!(matches!(err, ScriptError::IllegalOperation(_)));

    let forced = StartOptions {
        force: true,
        ..StartOptions::default()
    };
    let second = rt.start("idle", Vec::new(), forced).unwrap();
    assert!(first.is_killed());
    assert_ne!(first.id(), second.id());
    rt.kill_all();
}

#[test]
fn test_untrusted_script_cannot_start_others() {
    let (rt, out) = runtime(&["boss"]);
    rt.loader().register_source("helper", IDLE);

    start(&rt, "rogue", "start helper\n").unwrap();
    assert!(wait_for(|| out.echoed("--- exited", "rogue")));
    assert!(out.echoed(
        "--- illegal-operation: illegal operation: line 1: 'start' requires a trusted script",
        "rogue"
    ));
    assert!(!rt.exists("helper"));

    start(&rt, "boss", "start helper\n").unwrap();
    assert!(wait_for(|| rt.exists("helper")));
    rt.kill_all();
}

#[test]
fn test_arguments_and_arithmetic() {
    let (rt, out) = runtime(&[]);
    let program = Arc::new(compile("set total = $1 * 2 + 1\necho $0 -> $total\n").unwrap());
    rt.start_program(
        "math",
        program,
        vec!["20".into(), "extra".into()],
        StartOptions::default(),
    )
    .unwrap();

    assert!(wait_for(|| out.echoed("--- exited", "math")));
    assert!(out.echoed("20 extra -> 41", "math"));
}

#[test]
fn test_cleanup_runs_after_worker_stops() {
    let (rt, out) = runtime(&[]);
    start(
        &rt,
        "ticker",
        "cleanup put stand\necho ready\nloop:\n put tick\n pause 0.01\n goto loop\n",
    )
    .unwrap();
    assert!(wait_for(|| out.echoed("ready", "ticker")));
    assert!(wait_for(|| out.sent().len() >= 3));

    rt.kill("ticker");
    let sent = out.sent();
    assert_eq!(sent.last(), Some(&("stand".to_string(), "ticker".to_string())));
    assert_eq!(sent.iter().filter(|(line, _)| line == "stand").count(), 1);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(out.sent().len(), sent.len());
}

#[test]
fn test_racing_kills_both_return_after_cleanup() {
    let (rt, out) = runtime(&[]);
    start(&rt, "camp", &format!("cleanup put stand\n{IDLE}")).unwrap();
    assert!(wait_for(|| out.echoed("ready", "camp")));
    let script = rt.registry().find("camp").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let killers: Vec<_> = (0..2)
        .map(|_| {
            let (rt, script, barrier) = (rt.clone(), Arc::clone(&script), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                rt.kill_script(&script);
                rt.registry().get(script.id()).is_none()
            })
        })
        .collect();

    for killer in killers {
        assert!(killer.join().unwrap());
    }
    assert_eq!(out.sent(), vec![("stand".to_string(), "camp".to_string())]);
    assert_eq!(out.echo_count("--- exited", "camp"), 1);
}

#[test]
fn test_move_waits_for_room_change() {
    let (rt, out, mut parser) = runtime_with_parser(&[]);
    start(&rt, "walk", "move north\necho moved $moved\n").unwrap();
    assert!(wait_for(|| out.sent() == vec![("north".to_string(), "walk".to_string())]));
    assert!(!out.echoed("moved 1", "walk"));

    parser.feed(r#"<pushStream id="room"/>North Road<popStream/>"#);
    assert!(wait_for(|| out.echoed("moved 1", "walk")));
    assert!(!out.echoed("no room change after 'north'", "walk"));
}

#[test]
fn test_nextroom_times_out_without_room_change() {
    let (rt, out, _parser) = runtime_with_parser(&[]);
    start(&rt, "stuck", "nextroom\necho moved $moved\n").unwrap();

    assert!(wait_for(|| out.echoed("--- exited", "stuck")));
    assert!(out.echoed("no room change after 'nextroom'", "stuck"));
    assert!(out.echoed("moved 0", "stuck"));
    assert!(out.sent().is_empty());
}
