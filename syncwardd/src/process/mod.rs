pub mod runner;

pub use runner::{
    CONFIG_FILE_NAME, EngineCommand, EngineLaunchConfig, ExitKind, ProcessRunner,
    RESTART_EXIT_CODE, RunnerError, TuningProvider, build_args, build_environment, classify_exit,
};
