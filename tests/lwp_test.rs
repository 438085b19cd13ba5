/*!
 * LWP Lifecycle Integration Tests
 *
 * Process teardown with sleeping LWPs, deferred frees, and reference
 * counting across threads
 */

use anykernel::lwp::LwpInfo;
use anykernel::{
    Credentials, ForkMode, LwpError, LwpFlags, LwpState, Runtime, RuntimeConfig, SleepResult,
    WaitChannel,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime(ncpu: usize) -> Runtime {
    Runtime::new(RuntimeConfig::default().with_ncpu(ncpu))
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_lwpexit_all_interrupts_sleepers() {
    let rt = runtime(2);
    let pid = rt.new_process(0, ForkMode::CleanFds).unwrap();
    let chan = WaitChannel(0x100);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            rt.spawn_lwp(pid, move |rt| {
                let lwp = rt.curlwp().unwrap();
                let mut interrupts = 0;
                loop {
                    match rt.sleep(chan).unwrap() {
                        SleepResult::Interrupted => {
                            interrupts += 1;
                            if lwp.quit_requested() {
                                break;
                            }
                        }
                        SleepResult::Woken | SleepResult::TimedOut => {}
                    }
                }
                interrupts
            })
            .unwrap()
        })
        .collect();

    wait_until(|| {
        rt.registry()
            .process_lwps(pid)
            .map(|lwps| lwps.iter().all(|l| l.wchan() == Some(chan)))
            .unwrap_or(false)
    });
    assert_eq!(rt.registry().lwp_count(pid), Some(3));

    rt.lwpexit_all(pid).unwrap();

    for handle in handles {
        assert!(handle.join().unwrap() >= 1);
    }
    assert!(!rt.registry().contains_process(pid));
    assert_eq!(rt.cpus().running(), 0);
}

#[test]
fn test_lwpexit_all_rejects_proc0() {
    let rt = runtime(1);
    assert!(matches!(rt.lwpexit_all(0), Err(LwpError::Proc0Exit)));
}

#[test]
fn test_lwpexit_all_unknown_process() {
    let rt = runtime(1);
    assert!(matches!(
        rt.lwpexit_all(4242),
        Err(LwpError::NoSuchProcess(4242))
    ));
}

#[test]
fn test_new_lwp_in_exiting_process_fails() {
    let rt = runtime(1);
    let pid = rt.new_process(0, ForkMode::CleanFds).unwrap();
    let anchor = rt.new_lwp(Some(pid), LwpFlags::empty()).unwrap();

    rt.registry().exit_process(pid).unwrap();
    assert!(rt.new_lwp(Some(pid), LwpFlags::empty()).is_err());

    rt.release_lwp(&anchor);
    assert!(!rt.registry().contains_process(pid));
}

#[test]
fn test_release_while_running_defers_free() {
    let rt = runtime(1);
    let lwp = rt.new_lwp(None, LwpFlags::empty()).unwrap();
    let pid = lwp.pid();

    rt.switch(Some(Arc::clone(&lwp))).unwrap();
    rt.schedule();
    assert!(!rt.release_lwp(&lwp));
    assert_eq!(lwp.state(), LwpState::Zombie);
    assert!(rt.registry().lookup(lwp.id()).is_some());

    rt.unschedule();
    assert!(rt.registry().lookup(lwp.id()).is_none());
    assert!(!rt.registry().contains_process(pid));
    assert!(rt.current_lwp().is_none());
}

#[test]
fn test_holds_from_many_threads_balance() {
    let rt = runtime(1);
    let lwp = rt.new_lwp(None, LwpFlags::empty()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let rt = rt.clone();
            let lwp = Arc::clone(&lwp);
            thread::spawn(move || {
                for _ in 0..100 {
                    rt.registry().hold(&lwp);
                    rt.registry().unhold(&lwp);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(lwp.refs(), 1);
    assert!(rt.release_lwp(&lwp));
    assert_eq!(lwp.refs(), 0);
}

#[test]
fn test_extra_hold_outlives_release() {
    let rt = runtime(1);
    let lwp = rt.new_lwp(None, LwpFlags::empty()).unwrap();

    rt.registry().hold(&lwp);
    assert!(!rt.release_lwp(&lwp));
    assert!(rt.registry().lookup(lwp.id()).is_some());

    assert!(rt.registry().unhold(&lwp));
    assert!(rt.registry().lookup(lwp.id()).is_none());
}

#[test]
fn test_wakeup_reaches_sleepers_in_other_process() {
    let rt = runtime(2);
    let pid = rt.new_process(0, ForkMode::CleanFds).unwrap();
    let anchor = rt.new_lwp(Some(pid), LwpFlags::empty()).unwrap();
    let object = Box::new([0u8; 8]);
    let chan = WaitChannel::of(&*object);

    let sleeper = rt
        .spawn_lwp(pid, move |rt| rt.sleep(chan).unwrap())
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let guard = rt.enter();
        let woken = rt.wakeup(chan);
        drop(guard);
        if woken > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "sleeper never queued");
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(sleeper.join().unwrap(), SleepResult::Woken);
    assert_eq!(rt.registry().lwp_count(pid), Some(1));
    rt.release_lwp(&anchor);
}

#[test]
fn test_fork_modes_control_descriptor_sharing() {
    let rt = runtime(1);
    let parent = rt.new_process(0, ForkMode::CleanFds).unwrap();
    let fds = rt.process_context(parent).unwrap().fds;
    let fd = fds
        .install(Arc::new(anykernel::MemFile::with_contents(b"x")))
        .unwrap();

    let copied = rt.new_process(parent, ForkMode::CopyFds).unwrap();
    let shared = rt.new_process(parent, ForkMode::ShareFds).unwrap();
    let clean = rt.new_process(parent, ForkMode::CleanFds).unwrap();

    assert!(rt.process_context(copied).unwrap().fds.get(fd).is_ok());
    assert!(rt.process_context(clean).unwrap().fds.get(fd).is_err());

    fds.close(fd).unwrap();
    assert!(rt.process_context(shared).unwrap().fds.get(fd).is_err());
    assert!(rt.process_context(copied).unwrap().fds.get(fd).is_ok());
    assert_eq!(rt.process_context(copied).unwrap().ppid, parent);
}

#[test]
fn test_credentials_and_snapshots() {
    let rt = runtime(1);
    let pid = rt.new_process(0, ForkMode::CleanFds).unwrap();
    assert!(rt.process_context(pid).unwrap().cred.is_root());

    rt.registry()
        .set_credentials(pid, Credentials::user(1000, 100))
        .unwrap();
    let child = rt.new_process(pid, ForkMode::CleanFds).unwrap();
    assert_eq!(rt.process_context(child).unwrap().cred.euid, 1000);

    let lwp = rt.new_lwp(Some(child), LwpFlags::empty()).unwrap();
    let infos: Vec<LwpInfo> = rt
        .registry()
        .list_lwps()
        .into_iter()
        .filter(|info| info.pid == child)
        .collect();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].state, LwpState::Created);
    assert_eq!(infos[0].refs, 1);

    let json = serde_json::to_string(&infos[0]).unwrap();
    assert!(json.contains("\"state\":\"created\""));

    let info = rt.registry().process_info(child).unwrap();
    assert_eq!((info.ppid, info.nlwps, info.dead), (pid, 1, false));
    rt.release_lwp(&lwp);
    assert!(!rt.registry().contains_process(child));
}
