//! stacklock binary entry point.

fn main() -> anyhow::Result<()> {
    stacklock::cli::run()
}
