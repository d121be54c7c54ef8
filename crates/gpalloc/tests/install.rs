//! Process-wide installation. `install` is one-shot, so the whole
//! lifecycle runs as a single test; the kill switch is checked in a child
//! process.

use gpalloc::{
    gpa_for_testing, install, AllocFlags, Hooks, InitError, OverrideHooks, Placement, Settings,
    POOL_CRASH_KEY,
};
use std::sync::Mutex;

#[derive(Default)]
struct Registry {
    hooks: Mutex<Vec<Hooks>>,
}

impl OverrideHooks for Registry {
    fn set_override_hooks(&self, hooks: Hooks) {
        self.hooks.lock().unwrap().push(hooks);
    }
}

fn settings() -> Settings {
    Settings {
        placement: Placement::Right,
        ..Settings::new(4, 4, 8, 1)
    }
}

#[test]
fn install_registers_hooks_once() {
    if std::env::var_os("GPALLOC_DISABLE").is_some() {
        return;
    }
    assert!(gpa_for_testing().is_none());

    let registry = Registry::default();
    let gpa = install(&settings(), None, &registry).expect("install");
    assert!(std::ptr::eq(gpa, gpa_for_testing().unwrap()));

    let hooks = {
        let registered = registry.hooks.lock().unwrap();
        assert_eq!(registered.len(), 1);
        registered[0]
    };

    assert_eq!(POOL_CRASH_KEY.name(), "gpalloc-pool");
    assert_eq!(POOL_CRASH_KEY.get(), Some(gpa.crash_key()));

    // Sampling frequency 1: every supported request is served.
    let p = (hooks.allocate)(100, AllocFlags::NONE, Some("Record")).expect("sampled");
    assert!(gpa.pointer_is_mine(p.as_ptr()));
    assert_eq!((hooks.size)(p.as_ptr()), Some(100));
    let meta = gpa.diagnose(p.as_ptr() as usize).unwrap().metadata.unwrap();
    assert_eq!(meta.type_name, Some("Record"));
    unsafe {
        std::ptr::write_bytes(p.as_ptr(), 0xAA, 100);
        assert!((hooks.free)(p.as_ptr()));
    }

    let z = (hooks.allocate)(64, AllocFlags::ZERO_FILL | AllocFlags::RETURN_NULL, None)
        .expect("sampled");
    let bytes = unsafe { std::slice::from_raw_parts(z.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { assert!((hooks.free)(z.as_ptr())) };

    assert!((hooks.allocate)(64, AllocFlags::from_bits(1 << 7), None).is_none());
    assert!((hooks.allocate)(0, AllocFlags::NONE, None).is_none());

    // Foreign pointers are left to the caller.
    let mut local = 0u8;
    let foreign = &mut local as *mut u8;
    assert_eq!((hooks.size)(foreign), None);
    unsafe { assert!(!(hooks.free)(foreign)) };

    let again = Registry::default();
    assert_eq!(
        install(&settings(), None, &again).err(),
        Some(InitError::AlreadyInstalled)
    );
    assert!(again.hooks.lock().unwrap().is_empty());
    assert_eq!(gpa.stats().allocated, 0);
    assert_eq!(gpa.stats().total_allocations, 2);
}

#[test]
fn disabled_driver() {
    if std::env::var_os("GPALLOC_DISABLE").is_none() {
        return;
    }
    let registry = Registry::default();
    assert_eq!(
        install(&settings(), None, &registry).err(),
        Some(InitError::Disabled)
    );
    assert!(registry.hooks.lock().unwrap().is_empty());
    assert!(gpa_for_testing().is_none());
}

#[test]
fn kill_switch_skips_install() {
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    let output = std::process::Command::new(&exe)
        .env("GPALLOC_DISABLE", "1")
        .arg("--exact")
        .arg("disabled_driver")
        .output()
        .expect("failed to spawn subprocess");
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stdout)
    );
}
