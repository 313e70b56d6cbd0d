//! Host channel for `--filter` mode.
//!
//! The host runtime drives the filter over stdin/stdout with a small line
//! protocol. A *string* is `<decimal length>\n<bytes>\n`; a missing value is
//! an empty line.
//!
//! ```text
//! host → filter   <name string> <argc line> <argc strings> <blob string>
//! filter → host   init-success
//! host → filter   evaluate
//! filter → host   get-attribute <name string>         host replies <string>
//! filter → host   set-attribute <name string> <value string>
//! filter → host   result <score string>
//! host → filter   shutdown | EOF
//! ```

use std::io::{self, BufRead, Write};

use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::error::{IjError, Result};
use crate::filter::{ImageJFilter, ObjectAttributes, SENTINEL_SCORE};
use crate::protocol::WireReader;

/// Startup message sent by the host before anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub filter_name: String,
    pub args: Vec<String>,
    pub blob: Vec<u8>,
}

fn host_io(e: io::Error) -> IjError {
    IjError::Host(e.to_string())
}

/// Both directions of the host channel.
pub struct HostChannel<R, W> {
    reader: WireReader<R>,
    writer: W,
}

impl<R: BufRead, W: Write> HostChannel<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            reader: WireReader::new(input),
            writer: output,
        }
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Read the startup message. `None` if the host closed the channel first.
    pub fn read_startup(&mut self) -> Result<Option<Startup>> {
        let Some(first) = self.reader.read_line_or_eof().map_err(host_io)? else {
            return Ok(None);
        };
        let filter_name = self
            .string_after(first)?
            .ok_or_else(|| IjError::Host("missing filter name".into()))?;
        let filter_name = text(filter_name, "filter name")?;

        let argc_line = self.reader.read_line().map_err(host_io)?;
        let argc: usize = std::str::from_utf8(&argc_line)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                IjError::Host(format!(
                    "bad argument count '{}'",
                    String::from_utf8_lossy(&argc_line)
                ))
            })?;

        let mut args = Vec::with_capacity(argc.min(64));
        for i in 0..argc {
            let arg = self
                .read_string()?
                .ok_or_else(|| IjError::Host(format!("missing argument {}", i)))?;
            args.push(text(arg, "argument")?);
        }
        let blob = self.read_string()?.unwrap_or_default();

        debug!(
            filter = %filter_name,
            args = args.len(),
            blob_bytes = blob.len(),
            "Startup message received"
        );
        Ok(Some(Startup {
            filter_name,
            args,
            blob,
        }))
    }

    /// Next command line from the host. `None` on EOF.
    pub fn read_command(&mut self) -> Result<Option<String>> {
        let line = self.reader.read_line_or_eof().map_err(host_io)?;
        Ok(line.map(|l| String::from_utf8_lossy(&l).into_owned()))
    }

    pub fn read_string(&mut self) -> Result<Option<Vec<u8>>> {
        let line = self.reader.read_line().map_err(host_io)?;
        self.string_after(line)
    }

    /// Finish reading a string whose length line has already been read.
    fn string_after(&mut self, len_line: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if len_line.is_empty() {
            return Ok(None);
        }
        let len: usize = std::str::from_utf8(&len_line)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                IjError::Host(format!(
                    "bad string length '{}'",
                    String::from_utf8_lossy(&len_line)
                ))
            })?;
        let bytes = self.reader.read_payload(len).map_err(host_io)?;
        if !self.reader.read_terminator().map_err(host_io)? {
            return Err(IjError::Host("string not terminated by a newline".into()));
        }
        Ok(Some(bytes))
    }

    pub fn send_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{}", line).map_err(host_io)
    }

    pub fn send_string(&mut self, bytes: &[u8]) -> Result<()> {
        writeln!(self.writer, "{}", bytes.len()).map_err(host_io)?;
        self.writer.write_all(bytes).map_err(host_io)?;
        self.writer.write_all(b"\n").map_err(host_io)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(host_io)
    }

    pub fn send_result(&mut self, score: i32) -> Result<()> {
        self.send_line("result")?;
        self.send_string(score.to_string().as_bytes())?;
        self.flush()
    }
}

fn text(bytes: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| IjError::Host(format!("{} is not UTF-8", what)))
}

/// The object currently being evaluated, reached through the host channel.
pub struct HostObject<'a, R, W> {
    channel: &'a mut HostChannel<R, W>,
}

impl<'a, R: BufRead, W: Write> HostObject<'a, R, W> {
    pub fn new(channel: &'a mut HostChannel<R, W>) -> Self {
        Self { channel }
    }
}

impl<R: BufRead, W: Write> ObjectAttributes for HostObject<'_, R, W> {
    fn read_attribute(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        self.channel.send_line("get-attribute")?;
        self.channel.send_string(name.as_bytes())?;
        self.channel.flush()?;
        self.channel.read_string()
    }

    fn write_attribute(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.channel.send_line("set-attribute")?;
        self.channel.send_string(name.as_bytes())?;
        self.channel.send_string(value)?;
        self.channel.flush()
    }
}

/// Run one filter instance against the host channel until the host shuts it
/// down.
///
/// The filter is finalized on every path once it has been initialized.
/// Request-level failures are reported to the host as the sentinel score;
/// host-channel violations and fatal errors end the loop with an error.
pub fn run_filter_main<R, W>(input: R, output: W, config: &FilterConfig) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let mut channel = HostChannel::new(input, output);
    let Some(startup) = channel.read_startup()? else {
        info!("Host closed the channel before startup");
        return Ok(());
    };

    let mut filter = ImageJFilter::initialize(
        &startup.args,
        &startup.blob,
        &startup.filter_name,
        config,
    )?;
    let served = channel
        .send_line("init-success")
        .and_then(|()| channel.flush())
        .and_then(|()| serve(&mut channel, &mut filter));
    let finalized = filter.finalize();

    served?;
    finalized
}

fn serve<R: BufRead, W: Write>(
    channel: &mut HostChannel<R, W>,
    filter: &mut ImageJFilter,
) -> Result<()> {
    let mut evaluated = 0u64;
    loop {
        let Some(command) = channel.read_command()? else {
            info!(evaluated, "Host closed the channel");
            return Ok(());
        };
        match command.as_str() {
            "evaluate" => {
                let score = match filter.evaluate(&mut HostObject::new(channel)) {
                    Ok(score) => score,
                    Err(e) if matches!(e, IjError::Host(_)) || e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(filter = %filter.name(), "Evaluation failed: {}", e);
                        SENTINEL_SCORE
                    }
                };
                channel.send_result(score)?;
                evaluated += 1;
            }
            "shutdown" => {
                info!(evaluated, "Host requested shutdown");
                return Ok(());
            }
            other => {
                return Err(IjError::Host(format!("unexpected command '{}'", other)));
            }
        }
    }
}
