//! Dispatches a bulk workload across remote workers over a shell transport.
//!
//! The binary exits with status `0` on normal completion, even when some
//! blocks were abandoned on excluded workers, and non-zero on fatal
//! configuration errors.

fn main() -> color_eyre::eyre::Result<()> {
    kssh::run()
}
