use std::io::Write;

/// `RUST_LOG` wins over both arguments.
pub fn init_logging(debug: bool, level: Option<&str>) {
    let filter = match level {
        Some(level) => level,
        None if debug => "debug",
        None => "info",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
