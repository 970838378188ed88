use std::cell::Cell;

// Config: the execution context
//
// Two per-thread flags steer every forward call:
//
//   enable_backprop  record operations on the tape so backward() can run
//   train            training behaviour for dropout and batch norm
//
// Overrides are scoped: a ConfigGuard saves the previous value, installs the
// new one, and restores the saved value when it is dropped, including while
// unwinding from a panic. Guards nest with stack discipline.
//
//   let _g = no_grad();        // inference, nothing recorded
//   let _t = test_mode();      // dropout off, batch norm uses running stats

/// Snapshot of the execution context flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub enable_backprop: bool,
    pub train: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_backprop: true,
            train: true,
        }
    }
}

/// A single context flag, for [`using_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    EnableBackprop,
    Train,
}

thread_local! {
    static CONFIG: Cell<Config> = Cell::new(Config::default());
}

/// The current thread's context.
pub fn current() -> Config {
    CONFIG.with(|c| c.get())
}

/// Whether forward calls record onto the tape.
pub fn is_recording() -> bool {
    current().enable_backprop
}

/// Whether stochastic/statistical ops use training behaviour.
pub fn is_training() -> bool {
    current().train
}

/// Restores the saved context when dropped.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct ConfigGuard {
    saved: Config,
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        CONFIG.with(|c| c.set(self.saved));
    }
}

/// Install `config` until the returned guard is dropped.
pub fn scoped(config: Config) -> ConfigGuard {
    let saved = CONFIG.with(|c| c.replace(config));
    ConfigGuard { saved }
}

/// Override one flag until the returned guard is dropped.
pub fn using_config(key: ConfigKey, value: bool) -> ConfigGuard {
    let mut next = current();
    match key {
        ConfigKey::EnableBackprop => next.enable_backprop = value,
        ConfigKey::Train => next.train = value,
    }
    scoped(next)
}

/// Disable graph recording.
pub fn no_grad() -> ConfigGuard {
    using_config(ConfigKey::EnableBackprop, false)
}

/// Switch to evaluation behaviour.
pub fn test_mode() -> ConfigGuard {
    using_config(ConfigKey::Train, false)
}

/// Run `f` with recording set to `enabled`; the previous value comes back
/// afterwards, whether `f` returns or panics.
pub fn with_recording<T>(enabled: bool, f: impl FnOnce() -> T) -> T {
    let _guard = using_config(ConfigKey::EnableBackprop, enabled);
    f()
}

/// Run `f` with the training flag set to `train`.
pub fn with_training<T>(train: bool, f: impl FnOnce() -> T) -> T {
    let _guard = using_config(ConfigKey::Train, train);
    f()
}
