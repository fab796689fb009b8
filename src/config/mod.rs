/// Knobs for [`crate::emit::compile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Inline capture-free functions at known call sites.
    pub inline: bool,
    /// Largest callee body, in IR nodes, that may be inlined.
    pub inline_budget: usize,
    /// Nested inline expansions allowed under one call site.
    pub max_inline_depth: usize,
    /// Emit `TRACE` frames when an error value propagates through a call site.
    pub traces: bool,
    /// Simulate every register's ownership along all paths after fixing lifetimes.
    pub verify_lifetimes: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            inline: true,
            inline_budget: 64,
            max_inline_depth: 4,
            traces: true,
            verify_lifetimes: cfg!(debug_assertions),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Non-tail call depth at which the VM gives up with a `stack-overflow` error value.
    pub max_frames: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions { max_frames: 10_000 }
    }
}
