pub mod clustering;
pub mod connectivity;
pub mod cross_val;
pub mod estimator;
pub mod features;
pub mod output;
pub mod pipeline;
pub mod selection;
pub mod stats;
pub mod svm;
