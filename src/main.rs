use capture_deck::AppConfig;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "capture-deck")]
#[command(about = "Mirror a capture server's tasks, recordings and conversions")]
#[command(version)]
struct Cli {
  /// Also play this task's live stream in MPV
  #[arg(long, value_name = "TASK_ID")]
  watch: Option<String>,
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();
  capture_deck::init_logging();

  let config = match AppConfig::load() {
    Ok(config) => config,
    Err(e) => {
      log::error!("{}", e);
      std::process::exit(2);
    }
  };

  if let Err(e) = capture_deck::run(config, cli.watch).await {
    log::error!("{}", e);
    std::process::exit(1);
  }
}
