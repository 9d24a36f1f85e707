//! Pipeline driver: runs the mmsafe passes in their canonical order and
//! reports per-stage outcomes.
//!
//! Order is fixed by the inter-pass contract: lock insertion and type
//! harmonization rewrite memory shapes the check optimizer reasons about, the
//! free finder feeds the block splitter, and the splitter's block set feeds
//! check removal.

use mmsafe_diag::{codes, Diagnostic, DiagnosticBag, Severity};
use mmsafe_freefind::FreeFinder;
use mmsafe_harmonize::harmonize_types;
use mmsafe_ir::{verify_module, Module, TypeCtx};
use mmsafe_keycheck::{CheckOpt, CheckOptOptions, SplitBlocks};
use mmsafe_locks::insert_locks;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

pub const STAGE_LOCKS: &str = "stage1_insert_locks";
pub const STAGE_HARMONIZE: &str = "stage2_harmonize_types";
pub const STAGE_FREEFIND: &str = "stage3_free_finder";
pub const STAGE_SPLIT: &str = "stage4_split_blocks";
pub const STAGE_KEYCHECK: &str = "stage5_key_check_opt";
pub const STAGE_VERIFY: &str = "stage6_verify";

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Hoist key checks to call sites before the removal dataflow.
    pub add_check_before_call: bool,
    /// Extra non-freeing symbol names injected into the free finder.
    pub extra_whitelist: Vec<String>,
    /// Run the IR verifier after the pipeline.
    pub verify: bool,
    pub max_errors: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            add_check_before_call: false,
            extra_whitelist: Vec::new(),
            verify: true,
            max_errors: 64,
        }
    }
}

/// Machine-readable pipeline outcome.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineReport {
    pub success: bool,
    /// Per-stage modified-the-module flags.
    pub changed: BTreeMap<String, bool>,
    pub timing_ms: BTreeMap<String, u64>,
    /// Redundant key checks erased by the optimizer.
    pub removed_checks: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl PipelineReport {
    fn absorb_stage(
        &mut self,
        stage: &str,
        start: Instant,
        changed: Option<bool>,
        diag: DiagnosticBag,
    ) -> bool {
        self.timing_ms
            .insert(stage.to_string(), start.elapsed().as_millis() as u64);
        if let Some(changed) = changed {
            self.changed.insert(stage.to_string(), changed);
        }
        let failed = diag.has_errors();
        self.diagnostics.extend(diag.diagnostics);
        if failed {
            self.diagnostics.push(Diagnostic::error(
                codes::MMD0001,
                format!("pipeline stopped: {stage} reported errors"),
            ));
        }
        failed
    }
}

/// Run the full pass pipeline over one module.
pub fn run_pipeline(
    module: &mut Module,
    types: &mut TypeCtx,
    config: &PipelineConfig,
) -> PipelineReport {
    let mut report = PipelineReport::default();

    {
        let start = Instant::now();
        let mut diag = DiagnosticBag::new(config.max_errors);
        let changed = insert_locks(module, types, &mut diag).unwrap_or(false);
        if report.absorb_stage(STAGE_LOCKS, start, Some(changed), diag) {
            return report;
        }
    }

    {
        let start = Instant::now();
        let mut diag = DiagnosticBag::new(config.max_errors);
        let changed = harmonize_types(module, types, &mut diag).unwrap_or(false);
        if report.absorb_stage(STAGE_HARMONIZE, start, Some(changed), diag) {
            return report;
        }
    }

    let mut finder = FreeFinder::new();
    {
        let start = Instant::now();
        finder
            .whitelist
            .extend(config.extra_whitelist.iter().cloned());
        let changed = finder.run(module);
        let _ = report.absorb_stage(
            STAGE_FREEFIND,
            start,
            Some(changed),
            DiagnosticBag::new(config.max_errors),
        );
    }

    let mut splitter = SplitBlocks::new();
    {
        let start = Instant::now();
        let changed = splitter.run(module, &finder);
        let _ = report.absorb_stage(
            STAGE_SPLIT,
            start,
            Some(changed),
            DiagnosticBag::new(config.max_errors),
        );
    }

    let mut opt = CheckOpt::new(CheckOptOptions {
        add_check_before_call: config.add_check_before_call,
    });
    {
        let start = Instant::now();
        let mut diag = DiagnosticBag::new(config.max_errors);
        let changed = opt
            .run(module, types, &splitter, &finder, &mut diag)
            .unwrap_or(false);
        report.removed_checks = opt.removed;
        if report.absorb_stage(STAGE_KEYCHECK, start, Some(changed), diag) {
            return report;
        }
    }

    if config.verify {
        let start = Instant::now();
        let mut diag = DiagnosticBag::new(config.max_errors);
        let _ = verify_module(module, types, &mut diag);
        if report.absorb_stage(STAGE_VERIFY, start, None, diag) {
            return report;
        }
    }

    report.success = !report
        .diagnostics
        .iter()
        .any(|d| d.severity == Severity::Error);
    report
}
