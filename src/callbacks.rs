//! Lifecycle callbacks: observers of the driver, never mutators of it.
//!
//! Callbacks see the model read-only at epoch, batch and per-layer
//! forward/backward boundaries. The shipped callbacks cover the reporting
//! surface: a printer for epoch banners and cross-model result fan-in, and
//! an activation dumper for offline inspection.

use std::path::PathBuf;

use anyhow::Result;

use crate::comm::Comm;
use crate::graph::LayerId;
use crate::model::Model;
use crate::{grid_bail, EvalType, ExecutionMode};

/// Observer notified at lifecycle hook points. Default implementations
/// no-op so a callback only writes the hooks it cares about.
pub trait Callback: Send {
    fn setup(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    fn on_batch_begin(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    fn on_forward_prop_begin(&mut self, _model: &Model, _layer: LayerId) -> Result<()> {
        Ok(())
    }

    fn on_forward_prop_end(&mut self, _model: &Model, _layer: LayerId) -> Result<()> {
        Ok(())
    }

    fn on_backward_prop_begin(&mut self, _model: &Model, _layer: LayerId) -> Result<()> {
        Ok(())
    }

    fn on_backward_prop_end(&mut self, _model: &Model, _layer: LayerId) -> Result<()> {
        Ok(())
    }

    fn on_validation_end(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    fn on_test_end(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }
}

/// Fan one scalar per model in to the world master.
///
/// On the world master this returns the per-model values in model order plus
/// their average when more than one model exists; everywhere else it returns
/// `None` after contributing. Only model masters may call this.
pub fn gather_model_values(
    comm: &Comm,
    value: EvalType,
) -> Result<Option<(Vec<EvalType>, Option<EvalType>)>> {
    debug_assert!(comm.am_model_master());
    if comm.am_world_master() {
        let values = comm.intermodel_gather(value)?;
        let average = if values.len() > 1 {
            Some(values.iter().sum::<EvalType>() / values.len() as EvalType)
        } else {
            None
        };
        Ok(Some((values, average)))
    } else {
        comm.intermodel_gather_to(value, comm.get_world_master())?;
        Ok(None)
    }
}

/// Prints epoch banners and gathers objective/metric results across model
/// replicas to the world master.
#[derive(Default)]
pub struct PrintCallback;

impl PrintCallback {
    fn report_results(&self, m: &Model) -> Result<()> {
        let comm = m.get_comm();

        let mode = m.get_execution_mode();
        let mode_string = match mode {
            ExecutionMode::Training => format!("training epoch {}", m.get_cur_epoch()),
            ExecutionMode::Validation => "validation".to_string(),
            ExecutionMode::Testing => "test".to_string(),
            _ => grid_bail!("invalid execution mode for reporting results"),
        };

        if !comm.am_model_master() {
            return Ok(());
        }

        let obj_fn = m.get_objective_function().get_history_mean_value();
        if let Some((values, average)) = gather_model_values(comm, obj_fn)? {
            for (i, v) in values.iter().enumerate() {
                println!("Model {} {} objective function : {}", i, mode_string, v);
            }
            if let Some(avg) = average {
                println!("World average {} objective function : {}", mode_string, avg);
            }
        }

        for entry in m.get_metrics() {
            let score = entry.report_metric(mode);
            if let Some((values, average)) = gather_model_values(comm, score)? {
                for (i, v) in values.iter().enumerate() {
                    println!(
                        "Model {} {} {} : {}{}",
                        i,
                        mode_string,
                        entry.metric.name(),
                        v,
                        entry.metric.display_unit()
                    );
                }
                if let Some(avg) = average {
                    println!(
                        "World average {} {} : {}{}",
                        mode_string,
                        entry.metric.name(),
                        avg,
                        entry.metric.display_unit()
                    );
                }
            }
        }
        Ok(())
    }
}

impl Callback for PrintCallback {
    fn setup(&mut self, model: &Model) -> Result<()> {
        if model.get_comm().am_world_master() {
            println!("Training with gridnet version {}", env!("CARGO_PKG_VERSION"));
        }
        Ok(())
    }

    fn on_epoch_begin(&mut self, m: &Model) -> Result<()> {
        if !m.get_comm().am_world_master() {
            return Ok(());
        }
        let layer = m.input_layer()?;
        let il = layer
            .as_input()
            .ok_or_else(|| crate::grid_error!("primary input is not an input layer"))?;
        const MODES: [ExecutionMode; 3] = [
            ExecutionMode::Training,
            ExecutionMode::Validation,
            ExecutionMode::Testing,
        ];
        let iters: Vec<String> = MODES
            .iter()
            .map(|&md| il.num_iterations_per_epoch(md).to_string())
            .collect();
        let global: Vec<String> = MODES
            .iter()
            .map(|&md| format!("{:4}", il.global_mini_batch_size(md)))
            .collect();
        let global_last: Vec<String> = MODES
            .iter()
            .map(|&md| format!("{:4}", il.global_last_mini_batch_size(md)))
            .collect();
        let local: Result<Vec<String>> = MODES
            .iter()
            .map(|&md| {
                Ok(format!(
                    "{:4}",
                    layer.local_mini_batch_cols(il.global_mini_batch_size(md))?
                ))
            })
            .collect();
        let local_last: Result<Vec<String>> = MODES
            .iter()
            .map(|&md| {
                Ok(format!(
                    "{:4}",
                    layer.local_mini_batch_cols(il.global_last_mini_batch_size(md))?
                ))
            })
            .collect();

        println!("{}", "-".repeat(80));
        println!(
            "[{}] Epoch : stats formated [tr/v/te] iter/epoch = [{}]",
            m.get_cur_epoch(),
            iters.join("/")
        );
        println!(
            "{:>23} [{}] global last MB = [{}]",
            "global MB =",
            global.join("/"),
            global_last.join("/")
        );
        println!(
            "{:>23} [{}]  local last MB = [{}]",
            "local MB =",
            local?.join("/"),
            local_last?.join("/")
        );
        println!("{}", "-".repeat(80));
        Ok(())
    }

    fn on_epoch_end(&mut self, m: &Model) -> Result<()> {
        self.report_results(m)
    }

    fn on_validation_end(&mut self, m: &Model) -> Result<()> {
        self.report_results(m)
    }

    fn on_test_end(&mut self, m: &Model) -> Result<()> {
        self.report_results(m)
    }
}

/// Writes each layer's activations after its forward pass to
/// `<basename>model<N>-epoch<E>-step<S>-<layer-name>-Activations`.
/// Target layers are skipped.
pub struct DumpActivationsCallback {
    basename: String,
}

impl DumpActivationsCallback {
    pub fn new(basename: &str) -> DumpActivationsCallback {
        DumpActivationsCallback {
            basename: basename.to_string(),
        }
    }
}

impl Callback for DumpActivationsCallback {
    fn on_forward_prop_end(&mut self, m: &Model, id: LayerId) -> Result<()> {
        let layer = m.layer(id);
        if layer.is_target() {
            return Ok(());
        }
        let file = PathBuf::from(format!(
            "{}model{}-epoch{}-step{}-{}-Activations",
            self.basename,
            m.get_comm().get_model_rank(),
            m.get_cur_epoch(),
            m.get_cur_step(),
            layer.name()
        ));
        layer.activations()?.write_ascii(&file)
    }
}
