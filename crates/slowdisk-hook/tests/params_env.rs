//! Parameters supplied through the environment.
//!
//! Kept in its own test binary since it mutates process environment.

use slowdisk_hook::config::{ModuleParams, WaitBounds, ENV_MAX_WAIT, ENV_MIN_WAIT, ENV_SEED};

#[test]
fn env_overrides_defaults() {
    std::env::remove_var(ENV_SEED);
    std::env::set_var(ENV_MIN_WAIT, "250");
    std::env::set_var(ENV_MAX_WAIT, "750");
    let params = ModuleParams::from_env();
    assert_eq!(params.bounds(), WaitBounds::new(250, 750));
    assert_eq!(params.seed, None);

    std::env::set_var(ENV_SEED, "17");
    std::env::set_var(ENV_MAX_WAIT, "-1");
    let params = ModuleParams::from_env();
    assert_eq!(params.bounds(), WaitBounds::new(250, 1000));
    assert_eq!(params.seed, Some(17));

    for var in [ENV_MIN_WAIT, ENV_MAX_WAIT, ENV_SEED] {
        std::env::remove_var(var);
    }
    assert_eq!(ModuleParams::from_env(), ModuleParams::default());
}
