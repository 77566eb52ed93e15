use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use classe_rs::io::config::{ModelConfig, load_config};
use classe_rs::io::data::{read_tip_states, write_tip_states};
use classe_rs::io::newick::{read_newick, write_newick};
use classe_rs::io::report::{
    LikelihoodSummary, MapSummary, SimulationSummary, param_names, write_simmap_trees, write_summary_json,
    write_trace_tsv,
};
use classe_rs::mcmc::run_mcmc;
use classe_rs::progress::Progress;
use classe_rs::utils::new_rng;
use classe_rs::{ForwardSimulator, ProcessAge, SimulatedTree, SseProcess, TipConditionedSimulator};

#[derive(Parser, Debug)]
#[command(name = "classe")]
#[command(about = "State-dependent speciation and extinction on time-trees", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    #[arg(long, global = true)]
    threads: Option<usize>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log-probability of a tree and its tip states
    Lnl {
        #[command(flatten)]
        input: TreeInput,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Sample a stochastic character map and ancestral states
    Map {
        #[command(flatten)]
        input: TreeInput,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// SIMMAP-annotated newick output
        #[arg(long)]
        out_tree: PathBuf,
        #[arg(long)]
        summary: Option<PathBuf>,
        #[arg(long)]
        ancestral_out: Option<PathBuf>,
    },
    /// Simulate trees forward in time
    Simulate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value_t = 1)]
        replicates: usize,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Simulate a tree backward from observed tip states
    SimulateTips {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Metropolis-Hastings sampling of the rates on a fixed tree
    Mcmc {
        #[command(flatten)]
        input: TreeInput,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long)]
        iterations: Option<usize>,
        /// Trace TSV output
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        simmap_out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct TreeInput {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    tree: PathBuf,
    /// Tip states as taxon<TAB>state; all tips missing when omitted
    #[arg(long)]
    data: Option<PathBuf>,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Some(n_threads) = cli.threads {
        if n_threads == 0 {
            bail!("--threads must be >= 1");
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| anyhow!("failed to configure Rayon global thread pool: {e}"))?;
    }
    let show_progress = !cli.no_progress;

    match cli.command {
        Command::Lnl { input, out } => {
            let (mut process, _) = build_process(&input)?;
            let ln_probability = process.ln_probability()?;
            println!("{ln_probability}");
            if let Some(out) = out {
                let tree = process.tree();
                let summary = LikelihoodSummary {
                    ln_probability,
                    ln_tree_shape: process.ln_prob_tree_shape(),
                    n_tips: tree.num_tips(),
                    n_sampled_ancestors: tree.num_sampled_ancestors(),
                    root_age: tree.root_age(),
                };
                write_summary_json(&out, &summary)?;
            }
        }
        Command::Map {
            input,
            seed,
            out_tree,
            summary,
            ancestral_out,
        } => {
            let (mut process, _) = build_process(&input)?;
            let mut rng = new_rng(seed);
            let ln_probability = process.ln_probability()?;
            if let Some(path) = ancestral_out {
                let states = process.draw_joint_conditional_ancestral_states(&mut rng)?;
                write_summary_json(&path, &states)?;
            }
            process.draw_stochastic_character_map(&mut rng)?;
            let simmap = process.simmap_newick();
            write_newick(&out_tree, &simmap)?;
            println!("SIMMAP tree: {}", out_tree.display());
            if let Some(path) = summary {
                let history = process.character_history();
                let summary = MapSummary {
                    ln_probability,
                    total_shifts: history.total_shifts(),
                    time_in_states: history.time_in_states.clone(),
                    num_shifts: history.num_shifts.clone(),
                    average_speciation: history.average_speciation.clone(),
                    average_extinction: history.average_extinction.clone(),
                    simmap_newick: simmap,
                };
                write_summary_json(&path, &summary)?;
            }
        }
        Command::Simulate {
            config,
            replicates,
            seed,
            out_dir,
        } => {
            if replicates == 0 {
                bail!("--replicates must be >= 1");
            }
            let cfg = load_config(&config)?;
            let sim = ForwardSimulator::new(&cfg.rates, cfg.process.process_age, cfg.simulation.clone())?;
            fs::create_dir_all(&out_dir).with_context(|| format!("failed to create {out_dir:?}"))?;
            let progress = Progress::bar(show_progress, replicates as u64, "simulate");
            let summaries = (1..=replicates)
                .into_par_iter()
                .map(|r| {
                    let rep_seed = seed.wrapping_add(r as u64 - 1);
                    let mut rng = new_rng(rep_seed);
                    let simulated = sim
                        .simulate(&mut rng)
                        .with_context(|| format!("replicate {r} failed"))?;
                    let summary = write_replicate(&out_dir, r, rep_seed, &simulated)?;
                    progress.tick();
                    Ok(summary)
                })
                .collect::<Result<Vec<_>>>()?;
            progress.finish("done");
            let summary_path = out_dir.join("summary.json");
            write_summary_json(&summary_path, &summaries)?;
            println!("Simulated {} trees into {}", summaries.len(), out_dir.display());
        }
        Command::SimulateTips {
            config,
            data,
            seed,
            out_dir,
        } => {
            let cfg = load_config(&config)?;
            let tips = read_tip_states(&data, cfg.rates.n_states())?;
            let sim = TipConditionedSimulator::new(&cfg.rates, cfg.simulation.clone())?;
            let mut rng = new_rng(seed);
            let spinner = Progress::spinner(show_progress, "simulate", "coalescing tips");
            let simulated = sim.simulate(&tips, &mut rng)?;
            spinner.finish("done");
            fs::create_dir_all(&out_dir).with_context(|| format!("failed to create {out_dir:?}"))?;
            let summary = write_replicate(&out_dir, 1, seed, &simulated)?;
            write_summary_json(&out_dir.join("summary.json"), &summary)?;
            println!("Simulated tree with root age {}", summary.root_age);
        }
        Command::Mcmc {
            input,
            seed,
            iterations,
            out,
            simmap_out,
        } => {
            let (mut process, cfg) = build_process(&input)?;
            let mut mcmc = cfg.mcmc.clone();
            if let Some(n) = iterations {
                mcmc.iterations = n;
            }
            if simmap_out.is_some() && mcmc.map_every.is_none() {
                mcmc.map_every = Some(1);
            }
            let mut rng = new_rng(seed);
            let names = param_names(process.rates());
            let trace = run_mcmc(&mut process, &mcmc, &mut rng, show_progress)?;
            write_trace_tsv(&out, &trace, &names)?;
            println!(
                "Acceptance rate {:.3}; trace: {}",
                trace.acceptance_rate(),
                out.display()
            );
            if let Some(path) = simmap_out {
                let n = write_simmap_trees(&path, &trace)?;
                println!("{n} SIMMAP trees: {}", path.display());
            }
        }
    }
    Ok(())
}

/// Loads the configuration, tree and tip data, pinning a root-age process to
/// the tree's root.
fn build_process(input: &TreeInput) -> Result<(SseProcess, ModelConfig)> {
    let cfg = load_config(&input.config)?;
    let tree = read_newick(&input.tree)?;
    let mut process_cfg = cfg.process.clone();
    if let ProcessAge::Root(age) = process_cfg.process_age
        && (age - tree.root_age()).abs() > 1e-9
    {
        warn!(
            configured = age,
            tree = tree.root_age(),
            "using the tree's root age as the process age"
        );
        process_cfg.process_age = ProcessAge::Root(tree.root_age());
    }
    let mut process = SseProcess::new(tree, cfg.rates.clone(), process_cfg)?;
    if let Some(path) = &input.data {
        let data = read_tip_states(path, process.n_states())?;
        data.check_covers(process.tree())?;
        process.set_data(data);
    }
    info!(
        tips = process.tree().num_tips(),
        states = process.n_states(),
        "loaded process"
    );
    Ok((process, cfg))
}

fn write_replicate(dir: &Path, r: usize, seed: u64, sim: &SimulatedTree) -> Result<SimulationSummary> {
    let stem = format!("replicate_{r:03}");
    let newick = sim.tree.to_newick();
    write_newick(&dir.join(format!("{stem}.nwk")), &newick)?;
    write_tip_states(&dir.join(format!("{stem}.tsv")), &sim.data)?;
    let simmap = sim
        .tree
        .to_newick_with(|i| Some(format!("character_history={}", sim.history.simmap(i))));
    write_newick(&dir.join(format!("{stem}.simmap.nwk")), &simmap)?;
    Ok(SimulationSummary {
        replicate: r,
        seed,
        n_tips: sim.tree.num_tips(),
        n_extinct: sim.tree.num_extinct_tips(),
        root_age: sim.tree.root_age(),
        total_shifts: sim.history.total_shifts(),
        time_in_states: sim.history.time_in_states.clone(),
        newick,
    })
}
