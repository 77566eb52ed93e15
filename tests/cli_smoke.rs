use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_path(prefix: &str, ext: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before unix epoch")
        .as_nanos();
    path.push(format!("{prefix}_{}_{}.{}", std::process::id(), nanos, ext));
    path
}

fn classe_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_classe"))
}

const CONFIG: &str = r#"{
    "rates": {
        "epochs": [ { "extinction": [0.2, 0.3], "speciation": { "flat": [1.0, 0.8] } } ]
    },
    "process": { "process_age": { "root": 2.0 }, "num_time_slices": 100 },
    "mcmc": { "iterations": 20, "sample_every": 5 }
}"#;

struct Inputs {
    config: PathBuf,
    tree: PathBuf,
    data: PathBuf,
}

impl Inputs {
    fn write(tag: &str) -> Self {
        let inputs = Self {
            config: unique_temp_path(&format!("classe_cli_{tag}_config"), "json"),
            tree: unique_temp_path(&format!("classe_cli_{tag}_tree"), "nwk"),
            data: unique_temp_path(&format!("classe_cli_{tag}_states"), "tsv"),
        };
        fs::write(&inputs.config, CONFIG).expect("failed to write config");
        fs::write(&inputs.tree, "((A:1,B:1):1,(C:0.5,D:0.5):1.5);\n").expect("failed to write tree");
        fs::write(&inputs.data, "A\t0\nB\t1\nC\t0\nD\t?\n").expect("failed to write states");
        inputs
    }

    fn cleanup(self) {
        let _ = fs::remove_file(self.config);
        let _ = fs::remove_file(self.tree);
        let _ = fs::remove_file(self.data);
    }
}

#[test]
fn cli_lnl_prints_finite_value_and_summary() {
    let inputs = Inputs::write("lnl");
    let summary = unique_temp_path("classe_cli_lnl_summary", "json");
    let output = Command::new(classe_binary())
        .arg("lnl")
        .arg("--config")
        .arg(&inputs.config)
        .arg("--tree")
        .arg(&inputs.tree)
        .arg("--data")
        .arg(&inputs.data)
        .arg("--out")
        .arg(&summary)
        .arg("--no-progress")
        .output()
        .expect("failed to run classe binary");
    assert!(output.status.success(), "classe lnl exited with non-zero status");

    let stdout = String::from_utf8(output.stdout).expect("stdout is utf-8");
    let value: f64 = stdout.trim().parse().expect("stdout is a number");
    assert!(value.is_finite() && value < 0.0);

    let v: Value = serde_json::from_str(&fs::read_to_string(&summary).expect("summary written"))
        .expect("summary json is invalid");
    assert_eq!(v["n_tips"], 4);
    assert!(v.get("ln_probability").is_some());

    let _ = fs::remove_file(summary);
    inputs.cleanup();
}

#[test]
fn cli_map_and_mcmc_write_outputs() {
    let inputs = Inputs::write("map");
    let simmap = unique_temp_path("classe_cli_simmap", "nwk");
    let trace = unique_temp_path("classe_cli_trace", "tsv");

    let status = Command::new(classe_binary())
        .args(["map", "--seed", "3"])
        .arg("--config")
        .arg(&inputs.config)
        .arg("--tree")
        .arg(&inputs.tree)
        .arg("--data")
        .arg(&inputs.data)
        .arg("--out-tree")
        .arg(&simmap)
        .status()
        .expect("failed to run classe map");
    assert!(status.success(), "classe map exited with non-zero status");
    let text = fs::read_to_string(&simmap).expect("simmap written");
    assert!(text.contains("character_history={"));

    let status = Command::new(classe_binary())
        .args(["mcmc", "--seed", "5", "--no-progress"])
        .arg("--config")
        .arg(&inputs.config)
        .arg("--tree")
        .arg(&inputs.tree)
        .arg("--data")
        .arg(&inputs.data)
        .arg("--out")
        .arg(&trace)
        .status()
        .expect("failed to run classe mcmc");
    assert!(status.success(), "classe mcmc exited with non-zero status");
    let trace_text = fs::read_to_string(&trace).expect("trace written");
    assert!(trace_text.starts_with("iteration\tln_likelihood\tln_prior\tmu[0]"));
    assert_eq!(trace_text.lines().count(), 1 + 4);

    let _ = fs::remove_file(simmap);
    let _ = fs::remove_file(trace);
    inputs.cleanup();
}

#[test]
fn cli_simulate_writes_replicates() {
    let inputs = Inputs::write("sim");
    let out_dir = unique_temp_path("classe_cli_sim", "d");
    let status = Command::new(classe_binary())
        .args(["simulate", "--replicates", "3", "--seed", "9", "--threads", "2", "--no-progress"])
        .arg("--config")
        .arg(&inputs.config)
        .arg("--out-dir")
        .arg(&out_dir)
        .status()
        .expect("failed to run classe simulate");
    assert!(status.success(), "classe simulate exited with non-zero status");
    for r in 1..=3 {
        assert!(out_dir.join(format!("replicate_{r:03}.nwk")).exists());
        assert!(out_dir.join(format!("replicate_{r:03}.tsv")).exists());
    }
    let v: Value = serde_json::from_str(&fs::read_to_string(out_dir.join("summary.json")).expect("summary"))
        .expect("summary json is invalid");
    assert_eq!(v.as_array().map(|a| a.len()), Some(3));

    let _ = fs::remove_dir_all(out_dir);
    inputs.cleanup();
}
