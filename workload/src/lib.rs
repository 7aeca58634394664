//! The compiled-in map/combine/reduce applications.
//!
//! Applications are chosen by [`WorkloadKind`] when a plan is built; there is
//! no lookup by arbitrary name at run time.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use common::Workload;

pub mod distinct;
pub mod log_analysis;
pub mod vertex_degree;
pub mod wc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    /// Count words (case-insensitive, punctuation stripped, at least 2 chars).
    #[value(name = "wc")]
    WordCount,
    /// Degree of every vertex of an edge list.
    VertexDegree,
    /// Request statistics of an Apache access log.
    LogAnalysis,
    /// Distinct values seen for every key of `key value` lines.
    Distinct,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 4] = [
        WorkloadKind::WordCount,
        WorkloadKind::VertexDegree,
        WorkloadKind::LogAnalysis,
        WorkloadKind::Distinct,
    ];

    pub fn workload(self) -> Workload {
        match self {
            WorkloadKind::WordCount => wc::workload(),
            WorkloadKind::VertexDegree => vertex_degree::workload(),
            WorkloadKind::LogAnalysis => log_analysis::workload(),
            WorkloadKind::Distinct => distinct::workload(),
        }
    }

    pub fn name(self) -> &'static str {
        self.workload().name
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkloadKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        try_named(s)
            .ok_or_else(|| anyhow!("The workload `{}` is not a known workload", s))
    }
}

/// Resolve a workload by its short name.
pub fn try_named(name: &str) -> Option<WorkloadKind> {
    WorkloadKind::ALL
        .into_iter()
        .find(|kind| kind.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in WorkloadKind::ALL {
            assert_eq!(kind.name().parse::<WorkloadKind>().unwrap(), kind);
        }
        assert!("matrix-multiply".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn combiners_only_on_associative_reducers() {
        for kind in WorkloadKind::ALL {
            let workload = kind.workload();
            if workload.combine_fn.is_some() {
                assert!(workload.reduce_associative, "{kind} has an unsafe combiner");
            }
        }
        assert!(!WorkloadKind::Distinct.workload().reduce_associative);
    }
}
