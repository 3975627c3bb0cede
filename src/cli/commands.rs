use crate::engine::{ComputeMode, CudaVersion, GpuBackend};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Picks, installs, benchmarks and runs a local inference engine
#[derive(Parser, Debug)]
#[command(
    name = "reader-llm",
    about = "Set up and run a local inference engine tuned to this machine",
    version,
    author,
    long_about = "reader-llm probes the host for GPUs and accelerator APIs, benchmarks every \
                  usable compute backend with a small reference model, recommends the largest \
                  model the machine runs comfortably and starts a llama.cpp server for it."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Verbose logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show detected CPU, memory, GPU and accelerator APIs")]
    Probe(FormatArgs),

    #[command(
        about = "List the compute backends setup would benchmark",
        long_about = "Lists compute candidates in the order setup tries them.\n\n\
                      Examples:\n  \
                      reader-llm candidates\n  \
                      reader-llm candidates --prefer cpu\n  \
                      reader-llm candidates --skip-weak-gpus --format json"
    )]
    Candidates(CandidatesArgs),

    #[command(
        about = "Show the tier table and a recommendation",
        long_about = "Without --tps the recommendation is a static estimate from memory and \
                      CPU cores; with --tps it maps a measured throughput to a tier.\n\n\
                      Examples:\n  \
                      reader-llm recommend\n  \
                      reader-llm recommend --tps 120 --mode gpu"
    )]
    Recommend(RecommendArgs),

    #[command(about = "Benchmark one or all compute candidates")]
    Benchmark(BenchmarkArgs),

    #[command(
        about = "Run the full setup: detect, benchmark, select, install and start",
        long_about = "Runs the complete setup flow. Press Ctrl-C at any point to cancel; the \
                      previously saved configuration is kept.\n\n\
                      Examples:\n  \
                      reader-llm setup\n  \
                      reader-llm setup --tier 2\n  \
                      reader-llm setup --model qwen3_4b_q4_k_m --serve"
    )]
    Setup(SetupArgs),

    #[command(about = "Show the saved configuration and whether its files are installed")]
    Status(FormatArgs),

    #[command(about = "Run the inference server in the foreground until Ctrl-C")]
    Serve(ServeArgs),

    #[command(about = "Show effective configuration")]
    Config(FormatArgs),

    #[command(subcommand, about = "Manage model files")]
    Models(ModelsCommand),

    #[command(subcommand, about = "Manage runtime packages")]
    Runtime(RuntimeCommand),
}

#[derive(Args, Debug, Clone)]
pub struct FormatArgs {
    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct CandidatesArgs {
    #[arg(long, value_parser = parse_compute_mode, help = "Compute mode to try first (cpu restricts to CPU)")]
    pub prefer: Option<ComputeMode>,

    #[arg(long, help = "Skip small, integrated and virtual GPUs")]
    pub skip_weak_gpus: bool,

    #[command(flatten)]
    pub output: FormatArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RecommendArgs {
    #[arg(long = "tps", value_name = "TOKENS_PER_SECOND", help = "Measured throughput")]
    pub tokens_per_second: Option<f64>,

    #[arg(long, value_parser = parse_compute_mode, default_value = "cpu", help = "Compute mode the throughput was measured on")]
    pub mode: ComputeMode,

    #[command(flatten)]
    pub output: FormatArgs,
}

#[derive(Args, Debug, Clone)]
pub struct BenchmarkArgs {
    #[arg(long, value_name = "LABEL", help = "Only benchmark the candidate with this label")]
    pub candidate: Option<String>,

    #[arg(long, help = "Install missing runtimes and the reference model first")]
    pub install: bool,

    #[command(flatten)]
    pub output: FormatArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SetupArgs {
    #[arg(long, value_name = "MODEL_ID", conflicts_with = "tier", help = "Model to install instead of the recommendation")]
    pub model: Option<String>,

    #[arg(long, help = "Tier to install instead of the recommendation")]
    pub tier: Option<u8>,

    #[arg(long, help = "Stop after the benchmark sweep and print the recommendation")]
    pub select_only: bool,

    #[arg(long, help = "Keep serving in the foreground after setup completes")]
    pub serve: bool,

    #[command(flatten)]
    pub output: FormatArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, value_name = "MODEL_ID", help = "Model to serve (defaults to the saved one)")]
    pub model: Option<String>,

    #[arg(long, value_parser = parse_compute_mode, help = "Compute mode (defaults to the saved one)")]
    pub mode: Option<ComputeMode>,

    #[arg(long, value_parser = parse_gpu_backend, help = "GPU backend for gpu or hybrid mode")]
    pub backend: Option<GpuBackend>,

    #[arg(long, help = "GPU layers in hybrid mode")]
    pub gpu_layers: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct ComputeArgs {
    #[arg(long, value_parser = parse_compute_mode, default_value = "cpu", help = "Compute mode")]
    pub mode: ComputeMode,

    #[arg(long, value_parser = parse_gpu_backend, help = "GPU backend (defaults to the platform's portable API)")]
    pub backend: Option<GpuBackend>,

    #[arg(long, value_parser = parse_cuda_version, help = "CUDA version for the cuda backend")]
    pub cuda_version: Option<CudaVersion>,
}

#[derive(Subcommand, Debug)]
pub enum ModelsCommand {
    #[command(about = "List installed models")]
    List(FormatArgs),

    #[command(about = "Install a catalog model, or any model from --source")]
    Install {
        model_id: String,
        #[arg(long, value_name = "URL_OR_PATH")]
        source: Option<String>,
    },

    #[command(about = "Delete an installed model")]
    Delete { model_id: String },

    #[command(about = "Copy a local GGUF file into the model store")]
    Import { path: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum RuntimeCommand {
    #[command(about = "Install the runtime for a compute configuration")]
    Install {
        #[command(flatten)]
        compute: ComputeArgs,
        #[arg(long, value_name = "URL_OR_PATH")]
        source: Option<String>,
    },

    #[command(about = "Show whether a runtime is installed")]
    Status {
        #[command(flatten)]
        compute: ComputeArgs,
        #[command(flatten)]
        output: FormatArgs,
    },

    #[command(about = "Delete a runtime")]
    Delete {
        #[command(flatten)]
        compute: ComputeArgs,
    },

    #[command(about = "Install a runtime from a local archive or directory")]
    Import {
        path: PathBuf,
        #[command(flatten)]
        compute: ComputeArgs,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}

fn parse_compute_mode(s: &str) -> Result<ComputeMode, String> {
    s.parse()
}

fn parse_gpu_backend(s: &str) -> Result<GpuBackend, String> {
    s.parse()
}

fn parse_cuda_version(s: &str) -> Result<CudaVersion, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_args_verify() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_setup_defaults() {
        let args = CliArgs::parse_from(["reader-llm", "setup"]);
        match args.command {
            Commands::Setup(setup) => {
                assert!(setup.model.is_none());
                assert!(setup.tier.is_none());
                assert!(!setup.select_only);
                assert!(!setup.serve);
                assert_eq!(setup.output.format, OutputFormatArg::Human);
            }
            _ => panic!("Expected Setup command"),
        }
    }

    #[test]
    fn test_setup_model_conflicts_with_tier() {
        let result =
            CliArgs::try_parse_from(["reader-llm", "setup", "--model", "m", "--tier", "2"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_candidates_with_preference() {
        let args = CliArgs::parse_from([
            "reader-llm",
            "candidates",
            "--prefer",
            "hybrid",
            "--skip-weak-gpus",
            "--format",
            "json",
        ]);
        match args.command {
            Commands::Candidates(c) => {
                assert_eq!(c.prefer, Some(ComputeMode::Hybrid));
                assert!(c.skip_weak_gpus);
                assert_eq!(c.output.format, OutputFormatArg::Json);
            }
            _ => panic!("Expected Candidates command"),
        }
    }

    #[test]
    fn test_runtime_install_parses_compute() {
        let args = CliArgs::parse_from([
            "reader-llm",
            "runtime",
            "install",
            "--mode",
            "gpu",
            "--backend",
            "cuda",
            "--cuda-version",
            "13.1",
        ]);
        match args.command {
            Commands::Runtime(RuntimeCommand::Install { compute, source }) => {
                assert_eq!(compute.mode, ComputeMode::Gpu);
                assert_eq!(compute.backend, Some(GpuBackend::Cuda));
                assert_eq!(compute.cuda_version, Some(CudaVersion::V13_1));
                assert!(source.is_none());
            }
            _ => panic!("Expected runtime install"),
        }
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        assert!(CliArgs::try_parse_from(["reader-llm", "recommend", "--mode", "tpu"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let args = CliArgs::parse_from(["reader-llm", "-v", "--log-level", "debug", "probe"]);
        assert!(args.verbose);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(CliArgs::try_parse_from(["reader-llm", "-v", "-q", "probe"]).is_err());
    }
}
