// ─────────────────────────────────────────────────────────────────────
// SCPN Fusion Core — Field Histories
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Point probes of the potential or the electric field, sampled during a
//! run and rewritten to text files after every sample.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use fusion_types::config::{HistoryConfig, RunConfig};
use fusion_types::error::{FusionError, FusionResult};
use serde::{Deserialize, Serialize};

use crate::block_array::LevelData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryField {
    Potential,
    Efield,
}

impl HistoryField {
    pub fn parse(name: &str) -> FusionResult<Self> {
        match name {
            "potential" => Ok(HistoryField::Potential),
            "Efield" | "efield" => Ok(HistoryField::Efield),
            other => Err(FusionError::ConfigError(format!("unknown history field '{other}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HistoryField::Potential => "potential",
            HistoryField::Efield => "Efield",
        }
    }
}

/// Samples of one probe. `index` is 1-based and names the output files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldHistory {
    pub index: usize,
    pub field: HistoryField,
    pub block: usize,
    pub indices: [i64; 2],
    pub steps: Vec<usize>,
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl FieldHistory {
    pub fn new(index: usize, cfg: &HistoryConfig) -> FusionResult<Self> {
        Ok(FieldHistory {
            index,
            field: HistoryField::parse(&cfg.field)?,
            block: cfg.block,
            indices: cfg.indices,
            steps: Vec::new(),
            times: Vec::new(),
            values: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn stem(&self) -> String {
        format!("{}_hist_{}", self.field.name(), self.index)
    }

    /// `<field>_hist_<n>.curve` holds `time value` lines, the `.txt`
    /// twin `step time value`. Both are rewritten from scratch.
    pub fn write(&self, dir: &Path) -> FusionResult<()> {
        let [i, j] = self.indices;
        let mut curve = BufWriter::new(File::create(dir.join(format!("{}.curve", self.stem())))?);
        writeln!(curve, "# {i}, {j}")?;
        let mut table = BufWriter::new(File::create(dir.join(format!("{}.txt", self.stem())))?);
        writeln!(table, "# step  time  {} at ix,iy = {i}, {j}", self.field.name())?;
        for ((s, t), v) in self.steps.iter().zip(&self.times).zip(&self.values) {
            writeln!(curve, "{t:.12e} {v:.12e}")?;
            writeln!(table, "{s} {t:.12e} {v:.12e}")?;
        }
        curve.flush()?;
        table.flush()?;
        Ok(())
    }
}

/// Every probe of a run plus the sampling frequency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldHistories {
    frequency: usize,
    probes: Vec<FieldHistory>,
}

impl FieldHistories {
    /// Probes from `simulation.histories`; none unless `history` is set.
    pub fn from_config(cfg: &RunConfig) -> FusionResult<Self> {
        if !cfg.history {
            return Ok(Self::default());
        }
        let probes = cfg
            .histories
            .iter()
            .enumerate()
            .map(|(n, h)| FieldHistory::new(n + 1, h))
            .collect::<FusionResult<Vec<_>>>()?;
        Ok(FieldHistories {
            frequency: cfg.history_frequency.max(1),
            probes,
        })
    }

    pub fn probes(&self) -> &[FieldHistory] {
        &self.probes
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Adopt samples from a checkpoint. Probes are matched by position
    /// and must watch the same field at the same cell.
    pub fn restore(&mut self, saved: FieldHistories) -> FusionResult<()> {
        if saved.probes.len() != self.probes.len() {
            return Err(FusionError::ConfigError(format!(
                "checkpoint has {} history probes, input deck {}",
                saved.probes.len(),
                self.probes.len()
            )));
        }
        for (mine, theirs) in self.probes.iter_mut().zip(saved.probes) {
            if mine.field != theirs.field || mine.block != theirs.block || mine.indices != theirs.indices {
                return Err(FusionError::ConfigError(format!(
                    "history probe {} changed since the checkpoint",
                    mine.index
                )));
            }
            *mine = theirs;
        }
        Ok(())
    }

    /// Sample every probe on steps that are multiples of the frequency, or
    /// unconditionally with `force` (start of a run). Component 0 of the
    /// watched field is recorded.
    pub fn record(
        &mut self,
        step: usize,
        time: f64,
        phi: &LevelData,
        e_cell: &LevelData,
        force: bool,
        dir: &Path,
    ) -> FusionResult<()> {
        if self.probes.is_empty() || (step % self.frequency != 0 && !force) {
            return Ok(());
        }
        for probe in &mut self.probes {
            let data = match probe.field {
                HistoryField::Potential => phi,
                HistoryField::Efield => e_cell,
            };
            let [i, j] = probe.indices;
            let v = data.get(probe.block, i, j, 0)?;
            probe.steps.push(step);
            probe.times.push(time);
            probe.values.push(v);
            probe.write(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::config::{DiscretizationConfig, GeometryConfig, SlabConfig};

    use crate::block_array::ComponentKind;
    use crate::geometry::MultiblockGeometry;

    fn run_config(histories: Vec<HistoryConfig>) -> RunConfig {
        RunConfig {
            max_step: 4,
            max_time: 1.0,
            fixed_dt: None,
            cfl: 0.5,
            checkpoint_interval: 0,
            checkpoint_prefix: "chk".to_string(),
            plot_interval: 0,
            plot_prefix: "plt".to_string(),
            output_dir: ".".to_string(),
            history: true,
            history_frequency: 2,
            histories,
        }
    }

    fn probe(field: &str, indices: [i64; 2]) -> HistoryConfig {
        HistoryConfig {
            block: 0,
            indices,
            field: field.to_string(),
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = FieldHistories::from_config(&run_config(vec![probe("density", [0, 0])])).expect_err("bad field");
        assert!(matches!(err, FusionError::ConfigError(_)));
    }

    #[test]
    fn test_record_and_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let g = MultiblockGeometry::new(&GeometryConfig::Slab(SlabConfig {
            cells: [4, 4],
            xmax: 1.0,
            ymax: 1.0,
            bz_inner: 1.0,
            bz_outer: 1.0,
            by_inner: 0.0,
            periodic_poloidal: true,
            discretization: DiscretizationConfig::default(),
        }))
        .expect("slab");
        let mut phi = LevelData::new(g.layout(), 1, ComponentKind::Scalar);
        phi.set_val(0.0);
        phi.set(0, 2, 1, 0, 3.5).expect("set");
        let mut e = LevelData::new(g.layout(), 2, ComponentKind::MappedVector);
        e.set_val(-1.0);

        let mut h = FieldHistories::from_config(&run_config(vec![probe("potential", [2, 1]), probe("Efield", [0, 0])]))
            .expect("histories");
        for step in 0..4 {
            h.record(step, 0.1 * step as f64, &phi, &e, step == 1, dir.path()).expect("record");
        }
        // Steps 0 and 2 by frequency, step 1 forced.
        assert_eq!(h.probes()[0].steps, vec![0, 1, 2]);
        assert_eq!(h.probes()[0].values, vec![3.5; 3]);
        assert_eq!(h.probes()[1].values, vec![-1.0; 3]);

        let txt = std::fs::read_to_string(dir.path().join("potential_hist_1.txt")).expect("txt");
        let lines: Vec<&str> = txt.lines().collect();
        assert_eq!(lines[0], "# step  time  potential at ix,iy = 2, 1");
        assert_eq!(lines.len(), 4);
        assert!(lines[3].starts_with("2 "));
        let curve = std::fs::read_to_string(dir.path().join("Efield_hist_2.curve")).expect("curve");
        assert_eq!(curve.lines().next(), Some("# 0, 0"));
    }

    #[test]
    fn test_restore_checks_probe_identity() {
        let cfg = run_config(vec![probe("potential", [1, 1])]);
        let mut saved = FieldHistories::from_config(&cfg).expect("histories");
        saved.probes[0].steps.push(7);
        saved.probes[0].times.push(0.7);
        saved.probes[0].values.push(2.0);

        let mut fresh = FieldHistories::from_config(&cfg).expect("histories");
        fresh.restore(saved.clone()).expect("restore");
        assert_eq!(fresh.probes()[0].len(), 1);

        let mut moved = FieldHistories::from_config(&run_config(vec![probe("potential", [2, 1])])).expect("histories");
        assert!(moved.restore(saved).is_err());
    }
}
