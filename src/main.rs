use reader_llm::cli::commands::{CliArgs, Commands};
use reader_llm::cli::handlers::{
    handle_benchmark, handle_candidates, handle_config, handle_models, handle_probe,
    handle_recommend, handle_runtime, handle_serve, handle_setup, handle_status,
};
use reader_llm::{init_logging, LoggingConfig, VERSION};

use clap::Parser;
use tracing::debug;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(LoggingConfig::from_flags(
        args.log_level.as_deref(),
        args.verbose,
        args.quiet,
    ));

    debug!("reader-llm v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Probe(probe_args) => handle_probe(probe_args).await,
        Commands::Candidates(candidates_args) => handle_candidates(candidates_args).await,
        Commands::Recommend(recommend_args) => handle_recommend(recommend_args).await,
        Commands::Benchmark(benchmark_args) => handle_benchmark(benchmark_args).await,
        Commands::Setup(setup_args) => handle_setup(setup_args).await,
        Commands::Status(status_args) => handle_status(status_args).await,
        Commands::Serve(serve_args) => handle_serve(serve_args).await,
        Commands::Config(config_args) => handle_config(config_args).await,
        Commands::Models(models_command) => handle_models(models_command).await,
        Commands::Runtime(runtime_command) => handle_runtime(runtime_command).await,
    };

    std::process::exit(exit_code);
}
