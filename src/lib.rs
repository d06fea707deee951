//! gridnet: a small distributed neural-network training core.
//!
//! Layers, weights, objective-function terms, metrics and callbacks compose
//! into a [`model::Model`] that drives training and evaluation across a
//! process grid with partitioned matrices. Concrete layer kernels, dataset
//! parsers and optimizer math stay behind traits; this crate owns the
//! execution driver, the composition contracts and the checkpoint protocol.

use strum::{Display, EnumString};

pub mod callbacks;
pub mod checkpoint;
pub mod comm;
pub mod configs;
pub mod data;
pub mod graph;
pub mod layers;
pub mod matrix;
pub mod metrics;
pub mod model;
pub mod objective;
pub mod weights;

/// Numeric type for model evaluation: losses, metrics, reported statistics.
pub type EvalType = f64;

/// Distribution scheme of a partitioned matrix over the process grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixFormat {
    /// Rows partitioned over grid columns, columns over grid rows.
    McMr,
    /// Whole matrix on a single root rank.
    CircCirc,
    /// Replicated on every rank.
    StarStar,
    /// Columns partitioned round the model's ranks.
    StarVc,
    /// Rows partitioned over grid columns, columns replicated.
    McStar,
    Invalid,
}

/// Data layout a layer declares at construction, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    ModelParallel,
    DataParallel,
    Invalid,
}

/// Single source of truth for the layout -> matrix distribution mapping.
/// Every buffer allocation goes through here; an invalid layout is a
/// configuration error, not a fallback.
pub fn data_layout_to_matrix_format(layout: DataLayout) -> anyhow::Result<MatrixFormat> {
    match layout {
        DataLayout::ModelParallel => Ok(MatrixFormat::McMr),
        // Weights are stored replicated and sample data partitioned along
        // the mini-batch dimension (StarVc).
        DataLayout::DataParallel => Ok(MatrixFormat::StarStar),
        DataLayout::Invalid => grid_bail!("invalid data layout selected: {:?}", layout),
    }
}

/// Execution mode of the network. The string forms ("training", ...) are
/// part of the logging and reporting surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionMode {
    Training,
    Validation,
    Testing,
    Prediction,
    Invalid,
}

/// Build an error whose message carries the source location, for
/// configuration and topology failures that must abort the run.
#[macro_export]
macro_rules! grid_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!("{} {} :: {}", file!(), line!(), format!($($arg)*))
    };
}

/// `return Err(grid_error!(...))`
#[macro_export]
macro_rules! grid_bail {
    ($($arg:tt)*) => {
        return Err($crate::grid_error!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn layout_to_format_mapping() {
        assert_eq!(
            data_layout_to_matrix_format(DataLayout::ModelParallel).unwrap(),
            MatrixFormat::McMr
        );
        assert_eq!(
            data_layout_to_matrix_format(DataLayout::DataParallel).unwrap(),
            MatrixFormat::StarStar
        );
        let err = data_layout_to_matrix_format(DataLayout::Invalid).unwrap_err();
        assert!(err.to_string().contains("invalid data layout"));
    }

    #[test]
    fn execution_mode_strings() {
        assert_eq!(ExecutionMode::Training.to_string(), "training");
        assert_eq!(ExecutionMode::Validation.to_string(), "validation");
        assert_eq!(ExecutionMode::Testing.to_string(), "testing");
        assert_eq!(ExecutionMode::Prediction.to_string(), "prediction");
        assert_eq!(
            ExecutionMode::from_str("testing").unwrap(),
            ExecutionMode::Testing
        );
    }
}
