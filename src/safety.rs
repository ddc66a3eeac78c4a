//! Static denylist check run on generated code before execution.
//!
//! This is a best-effort filter, not an isolation boundary. It does
//! case-sensitive substring matching only, so code that reaches the same
//! facilities through indirection passes. The sandbox's own restrictions
//! (see [`crate::sandbox`]) are the second layer.
//!
//! The converse also holds: harmless code that merely contains a token is
//! rejected, e.g. `ratio.x` (`io.`), `download(url)` (`load(`) or
//! `print("required")` (`require`). These rejections are expected; the model
//! sees [`SECURITY_BLOCK_MSG`] and rewrites the code.

/// Returned in place of output when [`is_safe`] rejects code.
pub const SECURITY_BLOCK_MSG: &str =
    "SECURITY ALERT: Execution blocked due to unsafe code pattern.";

/// Filesystem, process and dynamic-evaluation entry points, in both the
/// script dialect models tend to emit by habit and the sandbox's own.
pub const DENYLIST: &[&str] = &[
    "import os",
    "import sys",
    "import subprocess",
    "import shutil",
    "import pty",
    "__import__",
    "eval(",
    "exec(",
    "open(",
    "os.execute",
    "os.remove",
    "os.rename",
    "os.exit",
    "io.",
    "loadstring",
    "load(",
    "dofile",
    "loadfile",
    "require",
    "debug.",
    "package.",
    "setmetatable(_G",
    "rawset(_G",
];

/// `false` if `code` contains any denylisted token.
pub fn is_safe(code: &str) -> bool {
    first_violation(code).is_none()
}

/// The first denylisted token found in `code`, for logging.
pub fn first_violation(code: &str) -> Option<&'static str> {
    DENYLIST.iter().copied().find(|token| code.contains(token))
}
