pub mod results_dir;
pub mod tree_util;
