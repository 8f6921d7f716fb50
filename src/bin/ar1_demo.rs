/// First-order autoregressive parameter estimation
///
/// Generates x_k = phi * x_{k-1} and recovers phi with a one-state,
/// one-parameter ROUKF observing x directly.
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use nalgebra::DVector;
use roukf::{FilterType, FnModel, ParameterDistribution, Roukf, RoukfConfig, SigmaDistribution};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DistributionArg {
    Simplex,
    Canonic,
    Star,
    SimplexStar,
}

impl From<DistributionArg> for SigmaDistribution {
    fn from(arg: DistributionArg) -> Self {
        match arg {
            DistributionArg::Simplex => SigmaDistribution::Simplex,
            DistributionArg::Canonic => SigmaDistribution::Canonic,
            DistributionArg::Star => SigmaDistribution::Star,
            DistributionArg::SimplexStar => SigmaDistribution::SimplexStar,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ar1_demo")]
#[command(about = "Estimate the coefficient of an AR(1) series with a ROUKF", long_about = None)]
struct Args {
    /// Number of observations to assimilate
    #[arg(long, default_value = "200")]
    steps: usize,

    /// True AR(1) coefficient used to generate the data
    #[arg(long, default_value = "0.9")]
    phi: f64,

    /// Initial value of the series
    #[arg(long, default_value = "1.0")]
    x0: f64,

    /// Initial guess for phi
    #[arg(long, default_value = "0.0")]
    initial_phi: f64,

    /// Initial state variance
    #[arg(long, default_value = "1.0")]
    state_variance: f64,

    /// Initial parameter variance
    #[arg(long, default_value = "10.0")]
    parameter_variance: f64,

    /// Observation error variance
    #[arg(long, default_value = "1e-4")]
    observation_variance: f64,

    /// Sigma-point layout
    #[arg(long, value_enum, default_value = "canonic")]
    distribution: DistributionArg,

    /// Estimate phi in log space (requires a positive initial guess)
    #[arg(long, default_value_t = false)]
    mapped: bool,

    /// Fan sigma-point forecasts out over worker threads
    #[arg(long, default_value_t = false)]
    parallel: bool,

    /// Worker threads for --parallel (default: available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// JSON filter configuration, replaces the options above except the data ones
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the estimate every N steps (0 = only the summary)
    #[arg(long, default_value = "20")]
    print_every: usize,
}

fn build_config(args: &Args) -> anyhow::Result<RoukfConfig> {
    if let Some(path) = &args.config {
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return Ok(RoukfConfig::from_json_str(&json)?);
    }

    let mut config = RoukfConfig::new(1, 1, 1);
    config.initial_states = vec![args.x0];
    config.initial_parameters = vec![args.initial_phi];
    config.state_variance = vec![args.state_variance];
    config.parameter_variance = vec![args.parameter_variance];
    config.observation_variance = vec![args.observation_variance];
    config.sigma_distribution = args.distribution.into();
    config.workers = args.workers;
    if args.mapped {
        config.filter_type = FilterType::ModelMappedRoukf;
        config.distributions = vec![ParameterDistribution::Positive];
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = build_config(&args)?;
    let mut filter = Roukf::new(config)?;

    let model = FnModel::new(
        |x: &DVector<f64>, theta: &DVector<f64>| Ok(x * theta[0]),
        |x: &DVector<f64>| Ok(x.clone()),
    );

    println!("=== AR(1) parameter estimation (phi = {}) ===\n", args.phi);

    let mut truth = args.x0;
    for step in 1..=args.steps {
        truth *= args.phi;
        let observation = DVector::from_element(1, truth);

        let error = if args.parallel {
            filter.execute_step_parallel(&model, &observation)
        } else {
            filter.execute_step(&model, &observation)
        }
        .with_context(|| format!("filter step {}", step))?;

        if args.print_every > 0 && step % args.print_every == 0 {
            println!(
                "step {:5}  error {:.3e}  x {:+.6}  phi {:.6} ± {:.2e}",
                step,
                error,
                filter.states()[0],
                filter.parameters()[0],
                filter.parameters_std()[0]
            );
        }
    }

    println!("\n{}", filter);
    println!("\n{}", serde_json::to_string_pretty(&filter.summary())?);
    Ok(())
}
