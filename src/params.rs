//! Session configuration.

/// Evaluation settings for one session. The JIT is the only knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Compile each expression to native code instead of interpreting it.
    pub jit: bool,
}

impl Config {
    pub fn new() -> Self {
        Self { jit: true }
    }

    pub fn interpreter() -> Self {
        Self { jit: false }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
