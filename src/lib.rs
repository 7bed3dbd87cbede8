mod aofs_lib;

use lazy_static::lazy_static;
use mut_static::MutStatic;
pub use aofs_lib::*;

lazy_static! {
    // Store static mount point argument for signal call use
    pub static ref MOUNT_POINT: MutStatic<String> = MutStatic::new();
}
