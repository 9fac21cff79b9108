pub mod archive;
pub mod compress;
pub mod config;
pub mod diff;
pub mod history;
pub mod lock;
pub mod manager;
pub mod notifications;
pub mod result_error;
pub mod scheduler;
pub mod state_file;
pub mod validate;
pub mod versions;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
