// SPDX-License-Identifier: Apache-2.0

//! Translation benchmark: measures parse, transform, analysis, and
//! conversion time over a directory of action-tree JSON samples.
//!
//! Samples are independent compilations; they run across a worker pool with
//! one AST arena and one IR package per worker, with no shared mutable
//! state.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use actsynth_common::status::{Status, StatusResult};
use actsynth_ir::ir::Package;
use rayon::prelude::*;

use crate::analysis::AstAnalysisInformation;
use crate::ast::Module;
use crate::ir_convert::ActionIrConverter;
use crate::json_ast_parser::parse_module_from_json;
use crate::lowering::{lowering_transform, LoweringInfo};

/// Counts how many samples `<prefix><i>.json` exist in `benchmark_dir`,
/// starting from index 0 with no gaps.
pub fn check_benchmark_size(benchmark_dir: &str, prefix: &str) -> StatusResult<usize> {
    if !Path::new(benchmark_dir).is_dir() {
        return Err(Status::NotFound(format!(
            "benchmark directory does not exist: {}",
            benchmark_dir
        )));
    }
    let mut count = 0usize;
    loop {
        let path = sample_path(benchmark_dir, prefix, count);
        if !path.exists() {
            return Ok(count);
        }
        count += 1;
    }
}

fn sample_path(dir: &str, prefix: &str, idx: usize) -> PathBuf {
    Path::new(dir).join(format!("{}{}.json", prefix, idx))
}

/// Per-sample measurements.
pub struct SampleResult {
    pub index: usize,
    pub parser_duration: Duration,
    pub ast_size: u64,
    pub transform_duration: Duration,
    pub active_ast_size: u64,
    pub analysis_duration: Duration,
    pub conversion_duration: Duration,
    pub ir_nodes: usize,
    pub package: Package,
}

pub struct TranslationBenchmark {
    benchmark_dir: String,
    prefix: String,
    num_samples: usize,
    results: Vec<SampleResult>,
}

impl TranslationBenchmark {
    pub fn new(benchmark_dir: &str, prefix: &str, num_samples: usize) -> Self {
        TranslationBenchmark {
            benchmark_dir: benchmark_dir.to_string(),
            prefix: prefix.to_string(),
            num_samples,
            results: Vec::new(),
        }
    }

    fn run_one(&self, index: usize) -> StatusResult<SampleResult> {
        let path = sample_path(&self.benchmark_dir, &self.prefix, index);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Status::NotFound(format!("cannot read {}: {}", path.display(), e)))?;
        let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            Status::InvalidArgument(format!("{} is not valid JSON: {}", path.display(), e))
        })?;

        let started = Instant::now();
        let mut module: Module = parse_module_from_json(&json, None)?;
        let parser_duration = started.elapsed();
        let body = module
            .body
            .ok_or_else(|| Status::Internal("module has no body".to_string()))?;
        let ast_size = module.count_active_stmts(body);

        let started = Instant::now();
        let mut lowering_info = LoweringInfo::default();
        lowering_transform(&mut lowering_info, &mut module, ".", true, None)?;
        let transform_duration = started.elapsed();
        let body = module
            .body
            .ok_or_else(|| Status::Internal("module lost its body".to_string()))?;
        let active_ast_size = module.count_active_stmts(body);

        let started = Instant::now();
        let analysis = AstAnalysisInformation::analyze(&mut module, body)?;
        let analysis_duration = started.elapsed();

        let started = Instant::now();
        let converter = ActionIrConverter::new(&module, "action", &analysis, None)?;
        let function = converter.build(body)?;
        let conversion_duration = started.elapsed();

        let ir_nodes = function.nodes.len();
        let mut package = Package::new("actions");
        package.members.push(function);
        package.set_top_fn("action").map_err(Status::Internal)?;

        Ok(SampleResult {
            index,
            parser_duration,
            ast_size,
            transform_duration,
            active_ast_size,
            analysis_duration,
            conversion_duration,
            ir_nodes,
            package,
        })
    }

    /// Runs every sample, fanning compilations out over the worker pool.
    pub fn run(&mut self) -> StatusResult<()> {
        let mut results = (0..self.num_samples)
            .into_par_iter()
            .map(|i| self.run_one(i))
            .collect::<Result<Vec<_>, _>>()?;
        results.sort_by_key(|r| r.index);
        log::info!(
            "translated {} samples from {}",
            results.len(),
            self.benchmark_dir
        );
        self.results = results;
        Ok(())
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.results.iter().map(|r| &r.package)
    }

    pub fn dump_csv(&self) -> String {
        let mut out = String::from(
            "sample,parse_us,ast_stmts,transform_us,active_ast_stmts,analysis_us,conversion_us,ir_nodes\n",
        );
        for r in self.results.iter() {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{}\n",
                r.index,
                r.parser_duration.as_micros(),
                r.ast_size,
                r.transform_duration.as_micros(),
                r.active_ast_size,
                r.analysis_duration.as_micros(),
                r.conversion_duration.as_micros(),
                r.ir_nodes
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json() -> serde_json::Value {
        json!({
            "TYNAME": "BLOCK",
            "OP0": { "TYNAME": "IDENT", "STRING": "body" },
            "OP1": {
                "TYNAME": "LIST",
                "VALUES": [{
                    "TYNAME": "ASSIGN",
                    "OP0": { "TYNAME": "IDENT", "STRING": "out", "SIZE": 32, "GLOBAL": 1 },
                    "OP1": { "TYNAME": "IDENT", "STRING": "in", "SIZE": 32, "GLOBAL": 1 },
                }],
            },
        })
    }

    fn write_samples(dir: &Path, prefix: &str, count: usize) {
        for i in 0..count {
            let path = dir.join(format!("{}{}.json", prefix, i));
            std::fs::write(path, serde_json::to_string(&sample_json()).unwrap()).unwrap();
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "actsynth_benchmark_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn counts_contiguous_samples() {
        let dir = temp_dir("count");
        write_samples(&dir, "action_", 3);
        let count = check_benchmark_size(dir.to_str().unwrap(), "action_").unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn runs_and_dumps_csv() {
        let dir = temp_dir("run");
        write_samples(&dir, "action_", 2);
        let mut bench = TranslationBenchmark::new(dir.to_str().unwrap(), "action_", 2);
        bench.run().unwrap();
        assert_eq!(bench.packages().count(), 2);
        let csv = bench.dump_csv();
        let lines: Vec<&str> = csv.trim_end().lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sample,parse_us"));
        assert!(lines[1].starts_with("0,"));
        assert!(lines[2].starts_with("1,"));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let err = check_benchmark_size("/nonexistent/actsynth_bench", "p_").unwrap_err();
        assert!(matches!(err, Status::NotFound(_)));
    }
}
