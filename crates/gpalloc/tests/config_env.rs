//! `Settings::from_env` reads the real process environment, so each case
//! runs in a child process with the variables set.

use gpalloc::Settings;
use std::process::Command;

fn run_driver(driver: &str, vars: &[(&str, &str)]) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    let output = Command::new(&exe)
        .env("GPALLOC_ENV_CHILD", "1")
        .envs(vars.iter().copied())
        .arg("--exact")
        .arg(driver)
        .output()
        .expect("failed to spawn subprocess");
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stdout)
    );
}

fn in_child() -> bool {
    std::env::var_os("GPALLOC_ENV_CHILD").is_some()
}

#[test]
fn overrides_driver() {
    if !in_child() {
        return;
    }
    let s = Settings::from_env();
    assert_eq!(s.max_allocated_pages, 8);
    assert_eq!(s.num_metadata, 16);
    assert_eq!(s.total_pages, 32);
    assert_eq!(s.sampling_frequency, 500);
    assert_eq!(s.pages_per_slot, 2);
    assert_eq!(s.validate(), Ok(()));
}

#[test]
fn garbage_driver() {
    if !in_child() {
        return;
    }
    let s = Settings::from_env();
    let defaults = Settings::default();
    assert_eq!(s.max_allocated_pages, 8);
    assert_eq!(s.num_metadata, defaults.num_metadata);
    assert_eq!(s.total_pages, defaults.total_pages);
    assert_eq!(s.sampling_frequency, defaults.sampling_frequency);
    assert_eq!(s.pages_per_slot, defaults.pages_per_slot);
}

#[test]
fn env_overrides_every_knob() {
    run_driver(
        "overrides_driver",
        &[
            ("GPALLOC_MAX_ALLOCATIONS", "8"),
            ("GPALLOC_NUM_METADATA", "16"),
            ("GPALLOC_TOTAL_PAGES", "32"),
            ("GPALLOC_SAMPLING_FREQUENCY", "500"),
            ("GPALLOC_PAGES_PER_SLOT", "2"),
        ],
    );
}

#[test]
fn unparseable_values_keep_defaults() {
    run_driver(
        "garbage_driver",
        &[
            ("GPALLOC_MAX_ALLOCATIONS", "8"),
            ("GPALLOC_NUM_METADATA", "16k"),
            ("GPALLOC_TOTAL_PAGES", ""),
            ("GPALLOC_SAMPLING_FREQUENCY", "-1"),
            ("GPALLOC_PAGES_PER_SLOT", "99999999999999999999999"),
        ],
    );
}
