use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::config::Settings;

/// Writes every log line to stderr and appends it to a file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global logger. `RUST_LOG` takes precedence over `LOG_LEVEL`.
pub fn init(settings: &Settings) -> io::Result<()> {
    let env = env_logger::Env::new().default_filter_or(settings.log_level.to_ascii_lowercase());
    let mut builder = env_logger::Builder::from_env(env);

    if let Some(path) = &settings.log_file {
        let file = open_log_file(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }

    builder
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn tee_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.log");
        std::fs::write(&path, "existing\n").unwrap();

        let mut tee = Tee {
            file: open_log_file(&path).unwrap(),
        };
        tee.write_all(b"INFO started\n").unwrap();
        tee.flush().unwrap();

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "existing\nINFO started\n");
    }
}
