//! `farmem-rankvars`: find environment variables that identify rank.
//!
//! The launch wrapper needs one environment variable whose value names
//! each process's rank (or at least distinguishes rank 0), so the core
//! can short-circuit peers that will never run user code. Which
//! variable that is depends on the launcher; this tool reports the
//! candidates.
//!
//! Usage: `farmem-rankvars [env-file ...]`
//!
//! Each argument is a `KEY=VALUE`-per-line snapshot of one rank's
//! environment, rank 0 first. With no arguments the live environment
//! is classified as a single rank-0 snapshot, which can only surface
//! "defined only on rank 0" candidates.

use std::collections::HashMap;

/// How strongly a variable indicates rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RankSignal {
    /// Defined with the wrong value somewhere: useless.
    NotRank,
    /// Defined only on rank 0: good enough to distinguish the master.
    GoodEnough,
    /// Equals the local rank on every rank.
    IsRank,
}

/// Classify one variable across all ranks' environments.
fn classify(key: &str, envs: &[HashMap<String, String>]) -> RankSignal {
    let mut signal = RankSignal::IsRank;
    for (rank, env) in envs.iter().enumerate() {
        let this = match env.get(key) {
            Some(value) if value == &rank.to_string() => RankSignal::IsRank,
            Some(_) => RankSignal::NotRank,
            // Missing everywhere but rank 0 still identifies the master.
            None if rank > 0 => RankSignal::GoodEnough,
            None => RankSignal::NotRank,
        };
        signal = signal.min(this);
    }
    signal
}

/// All candidate variables, strongest signal first.
fn rank_candidates(envs: &[HashMap<String, String>]) -> Vec<(String, RankSignal)> {
    let Some(rank0) = envs.first() else {
        return Vec::new();
    };
    let mut found: Vec<(String, RankSignal)> = rank0
        .keys()
        .filter_map(|key| match classify(key, envs) {
            RankSignal::NotRank => None,
            signal => Some((key.clone(), signal)),
        })
        .collect();
    found.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    found
}

fn parse_env_file(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let envs: Vec<HashMap<String, String>> = if args.is_empty() {
        vec![std::env::vars().collect()]
    } else {
        args.iter()
            .map(|path| match std::fs::read_to_string(path) {
                Ok(content) => parse_env_file(&content),
                Err(err) => {
                    eprintln!("farmem-rankvars: cannot read {path}: {err}");
                    std::process::exit(1);
                }
            })
            .collect()
    };

    let candidates = rank_candidates(&envs);
    println!("The following environment variables seem to identify rank 0:");
    if candidates.is_empty() {
        println!("    [none]");
        return;
    }
    for (key, signal) in candidates {
        match signal {
            RankSignal::IsRank => {
                println!("    {key:<40} (correct rank at all processes)");
            }
            RankSignal::GoodEnough => {
                println!("    {key:<40} (defined only on rank 0)");
            }
            RankSignal::NotRank => unreachable!("filtered out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn exact_rank_variables_rank_highest() {
        let envs = vec![
            env(&[("PMI_RANK", "0"), ("HOST", "a")]),
            env(&[("PMI_RANK", "1"), ("HOST", "b")]),
            env(&[("PMI_RANK", "2"), ("HOST", "c")]),
        ];
        let found = rank_candidates(&envs);
        assert_eq!(found, vec![("PMI_RANK".to_owned(), RankSignal::IsRank)]);
    }

    #[test]
    fn rank0_only_variables_are_good_enough() {
        let envs = vec![
            env(&[("LAUNCHER_MASTER", "yes"), ("SHELL", "/bin/sh")]),
            env(&[("SHELL", "/bin/sh")]),
        ];
        let found = rank_candidates(&envs);
        assert_eq!(
            found,
            vec![("LAUNCHER_MASTER".to_owned(), RankSignal::GoodEnough)]
        );
    }

    #[test]
    fn wrong_values_disqualify() {
        let envs = vec![
            env(&[("SLOT", "0")]),
            env(&[("SLOT", "7")]), // defined, but not the rank
        ];
        assert!(rank_candidates(&envs).is_empty());
    }

    #[test]
    fn single_snapshot_finds_zero_valued_keys() {
        let envs = vec![env(&[("MY_RANK", "0"), ("PATH", "/usr/bin")])];
        let found = rank_candidates(&envs);
        assert_eq!(found, vec![("MY_RANK".to_owned(), RankSignal::IsRank)]);
    }

    #[test]
    fn env_files_parse_key_value_lines() {
        let parsed = parse_env_file("A=1\nB=two=three\nnonsense\n");
        assert_eq!(parsed.get("A").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("B").map(String::as_str), Some("two=three"));
        assert_eq!(parsed.len(), 2);
    }
}
