// Best-effort stderr logging that never panics.
//
// A tray process often runs without an attached console, where `eprintln!`
// can panic on write errors. Ignore stderr write failures explicitly.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
