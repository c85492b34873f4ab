use kestrel_scripting::app;
use kestrel_scripting::cli::CliOverrides;
use kestrel_scripting::config::AppConfig;
use kestrel_scripting::logging::init_logging;

const DEFAULT_CONFIG_PATH: &str = "config/app.json";

fn main() {
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    let config_path = cli.config_path().map(|path| path.to_path_buf()).unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
    let mut config = AppConfig::load_or_default(&config_path);
    let overrides = cli.into_config_overrides();
    config.apply_overrides(&overrides);
    init_logging(&config.logging.level);
    if !overrides.is_empty() {
        tracing::info!(fields = ?overrides.applied_fields(), "applied command line overrides");
    }

    match app::run(&config) {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("Report error: {err}"),
        },
        Err(err) => {
            eprintln!("Application error: {err:?}");
            std::process::exit(1);
        }
    }
}
