use compat_log::StaticLogConfig;

pub struct CompatLog;

impl StaticLogConfig for CompatLog {
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "llama-compat";
}
