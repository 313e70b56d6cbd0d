//! Filter lifecycle: initialize, evaluate, finalize.
//!
//! [`ImageJFilter::initialize`] builds the workspace, obtains a display and
//! starts the worker. Each [`ImageJFilter::evaluate`] call sends one object's
//! image with the configured macro and writes the worker's attributes and
//! result back to the object. [`ImageJFilter::finalize`] tears everything down.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info, warn};

use crate::config::{FilterConfig, FramingPolicy, ImageSource, ProtocolVariant};
use crate::display::{DisplayLease, allocate_display};
use crate::error::{IjError, Result};
use crate::protocol::{AttributeRecord, ImagePayload, SessionOutcome};
use crate::worker::{WorkerHandle, spawn_worker};
use crate::workspace;

/// Attribute holding the object's raw data.
pub const OBJECT_DATA_ATTR: &str = "";
/// Image height as a native-endian 4-byte integer.
pub const ROWS_ATTR: &str = "_rows.int";
/// Image width as a native-endian 4-byte integer.
pub const COLS_ATTR: &str = "_cols.int";
/// Decoded image, 4 bytes per pixel.
pub const RGB_IMAGE_ATTR: &str = "_rgb_image.rgbimage";
/// Numeric result of the last evaluation, a native-endian 8-byte double.
pub const RESULT_ATTR: &str = "_matlab_ans.double";

/// Score reported for a request that could not be evaluated.
pub const SENTINEL_SCORE: i32 = -1;

/// Attribute storage of one object, provided by the host.
pub trait ObjectAttributes {
    /// Returns `None` when the object has no such attribute.
    fn read_attribute(&mut self, name: &str) -> Result<Option<Vec<u8>>>;

    fn write_attribute(&mut self, name: &str, value: &[u8]) -> Result<()>;
}

/// Decode the base64 macro-name argument.
///
/// The decoded bytes must end with a NUL; the name is everything before the
/// first NUL.
pub fn decode_macro_name(arg: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(arg.trim())
        .map_err(|e| IjError::MacroName(format!("not base64: {}", e)))?;
    if bytes.last() != Some(&0) {
        return Err(IjError::MacroName("missing NUL terminator".into()));
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = std::str::from_utf8(&bytes[..end])
        .map_err(|e| IjError::MacroName(format!("not UTF-8: {}", e)))?;
    if name.is_empty() {
        return Err(IjError::MacroName("empty macro name".into()));
    }
    Ok(name.to_string())
}

/// One filter instance and the worker it owns.
#[derive(Debug)]
pub struct ImageJFilter {
    name: String,
    macro_name: String,
    worker: WorkerHandle,
    protocol: ProtocolVariant,
    image_source: ImageSource,
    framing_policy: FramingPolicy,
}

impl ImageJFilter {
    /// Bootstrap the workspace, obtain a display and start the worker.
    ///
    /// `args[0]` is the base64 macro name; `blob` is the tar macro bundle.
    /// Every error here is fatal and leaves nothing behind.
    pub fn initialize(
        args: &[String],
        blob: &[u8],
        filter_name: &str,
        config: &FilterConfig,
    ) -> Result<Self> {
        let arg = args
            .first()
            .ok_or_else(|| IjError::MacroName("no macro argument given".into()))?;
        let macro_name = decode_macro_name(arg)?;
        info!(filter = filter_name, macro_name = %macro_name, "Initializing filter");

        let workspace = workspace::bootstrap(&config.workspace, blob)?;

        let display = match config.display.fixed {
            Some(number) => {
                debug!(display = number, "Using fixed display");
                DisplayLease::fixed(number)
            }
            None => allocate_display(&config.display.server, config.display.max_candidates)?,
        };

        let worker = spawn_worker(&config.worker, workspace, display)?;

        Ok(Self {
            name: filter_name.to_string(),
            macro_name,
            worker,
            protocol: config.protocol,
            image_source: config.image_source,
            framing_policy: config.framing_policy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn macro_name(&self) -> &str {
        &self.macro_name
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// Run the macro against one object and return its integer score.
    ///
    /// Attributes reported by the worker are written to the object as they
    /// arrive. The numeric result is stored under [`RESULT_ATTR`]; a framing
    /// error stores and returns the sentinel. Any `Err` is confined to this
    /// request.
    pub fn evaluate<O>(&mut self, object: &mut O) -> Result<i32>
    where
        O: ObjectAttributes + ?Sized,
    {
        let image = self.read_image(object)?;
        let bytes = image.wire_bytes().map_err(|e| IjError::Attribute {
            name: RGB_IMAGE_ATTR.to_string(),
            problem: e.to_string(),
        })?;
        self.worker
            .send_request(&bytes, self.macro_name.as_bytes())?;

        let filter_name = &self.name;
        let mut sink = |record: AttributeRecord| -> Result<()> {
            let Ok(key) = std::str::from_utf8(&record.key) else {
                warn!(
                    filter = %filter_name,
                    key = %record.key_lossy(),
                    "Dropping worker attribute with a non-UTF-8 name"
                );
                return Ok(());
            };
            let mut value = record.value;
            value.push(0);
            object.write_attribute(key, &value)
        };
        let outcome = self.worker.read_outcome(self.protocol, &mut sink)?;

        if let SessionOutcome::Framing(e) = &outcome
            && self.framing_policy == FramingPolicy::TeardownWorker
        {
            warn!(filter = %self.name, "Tearing worker down after framing error: {}", e);
            if let Err(e) = self.worker.teardown() {
                warn!(filter = %self.name, "Teardown failed: {}", e);
            }
        }

        let result = outcome.value();
        object.write_attribute(RESULT_ATTR, &result.to_ne_bytes())?;

        // Truncates toward zero; out-of-range values saturate
        let score = result as i32;
        debug!(filter = %self.name, result, score, "Object evaluated");
        Ok(score)
    }

    /// Tear the worker down and remove the workspace.
    pub fn finalize(mut self) -> Result<()> {
        info!(filter = %self.name, "Finalizing filter");
        self.worker.teardown()
    }

    fn read_image<O>(&self, object: &mut O) -> Result<ImagePayload>
    where
        O: ObjectAttributes + ?Sized,
    {
        match self.image_source {
            ImageSource::ObjectData => Ok(ImagePayload::Encoded(required(
                object,
                OBJECT_DATA_ATTR,
            )?)),
            ImageSource::RgbImage => {
                let height = read_dimension(object, ROWS_ATTR)?;
                let width = read_dimension(object, COLS_ATTR)?;
                let rgbx = required(object, RGB_IMAGE_ATTR)?;
                Ok(ImagePayload::Pixels {
                    width,
                    height,
                    rgbx,
                })
            }
        }
    }
}

fn required<O: ObjectAttributes + ?Sized>(object: &mut O, name: &str) -> Result<Vec<u8>> {
    object
        .read_attribute(name)?
        .ok_or_else(|| IjError::missing_attribute(name))
}

fn read_dimension<O: ObjectAttributes + ?Sized>(object: &mut O, name: &str) -> Result<usize> {
    let bytes = required(object, name)?;
    let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| IjError::Attribute {
        name: name.to_string(),
        problem: format!("has {} bytes, expected 4", bytes.len()),
    })?;
    let value = i32::from_ne_bytes(raw);
    usize::try_from(value).map_err(|_| IjError::Attribute {
        name: name.to_string(),
        problem: format!("is negative ({})", value),
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::{ECHO_WORKER, MemoryObject};
    use super::*;
    use crate::workspace::fixtures::{asset_dir, tar_bundle};
    use serial_test::serial;
    use tempfile::{TempDir, tempdir};

    /// `"score"` plus NUL, base64-encoded.
    const SCORE_ARG: &str = "c2NvcmUA";

    /// Shell function consuming one request; fails once stdin is closed.
    const READ_REQUEST: &str = r#"
read_len() {
    set -- $(dd bs=1 count=4 2>/dev/null | od -An -tu1)
    [ $# -eq 4 ] || return 1
    echo $(( $1 * 16777216 + $2 * 65536 + $3 * 256 + $4 ))
}
read_request() {
    n=$(read_len) || return 1
    dd bs=1 count="$n" of=/dev/null 2>/dev/null
    m=$(read_len) || return 1
    dd bs=1 count="$m" of=/dev/null 2>/dev/null
}
"#;

    fn config(assets: &TempDir, worker_script: &str) -> FilterConfig {
        let sources = asset_dir(assets.path());
        FilterConfig {
            workspace: sources,
            ..FilterConfig::default()
        }
        .with_worker("sh", vec!["-c".into(), worker_script.into()])
        .with_fixed_display(77)
    }

    fn start(config: &FilterConfig) -> ImageJFilter {
        let bundle = tar_bundle(&[("score.ijm", b"run();")]);
        ImageJFilter::initialize(&[SCORE_ARG.to_string()], &bundle, "imagej", config).unwrap()
    }

    #[test]
    fn test_decode_macro_name() {
        assert_eq!(decode_macro_name("aGVsbG8A").unwrap(), "hello");
        // Only the part before the first NUL counts
        assert_eq!(decode_macro_name("YQBiAA==").unwrap(), "a");
    }

    #[test]
    fn test_decode_macro_name_requires_terminator() {
        // "hello" without NUL
        let err = decode_macro_name("aGVsbG8=").unwrap_err();
        assert!(matches!(err, IjError::MacroName(_)));
        assert!(err.is_fatal());

        assert!(decode_macro_name("not base64!").is_err());
        assert!(decode_macro_name("AA==").is_err());
    }

    #[test]
    fn test_missing_argument_is_fatal() {
        let assets = tempdir().unwrap();
        let err = ImageJFilter::initialize(&[], &[], "imagej", &config(&assets, "true"))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    #[serial(children)]
    fn test_evaluate_object_data() {
        let assets = tempdir().unwrap();
        let config = config(&assets, ECHO_WORKER);
        let mut filter = start(&config);
        assert_eq!(filter.macro_name(), "score");

        let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, b"JPEGDATA");
        let score = filter.evaluate(&mut object).unwrap();

        assert_eq!(score, 4);
        assert_eq!(object.result(), Some(4.5));
        assert_eq!(object.attrs["macro"], b"score\0".to_vec());
        assert_eq!(object.attrs["bytes"], b"8\0".to_vec());
        // Worker attributes land before the result
        assert_eq!(object.writes, vec!["macro", "bytes", RESULT_ATTR]);

        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_evaluate_repeatedly() {
        let assets = tempdir().unwrap();
        let config = config(&assets, ECHO_WORKER);
        let mut filter = start(&config);

        for len in [0usize, 1, 300, 70_000] {
            let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, &vec![7u8; len]);
            assert_eq!(filter.evaluate(&mut object).unwrap(), 4);
            assert_eq!(object.attrs["bytes"], format!("{}\0", len).into_bytes());
        }

        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_evaluate_rgb_image() {
        let assets = tempdir().unwrap();
        let config = config(&assets, ECHO_WORKER).with_image_source(ImageSource::RgbImage);
        let mut filter = start(&config);

        let mut object = MemoryObject::default()
            .with(ROWS_ATTR, &2i32.to_ne_bytes())
            .with(COLS_ATTR, &3i32.to_ne_bytes())
            .with(RGB_IMAGE_ATTR, &[0u8; 2 * 3 * 4]);
        filter.evaluate(&mut object).unwrap();

        // 2 x 3 pixels, 3 bytes each
        assert_eq!(object.attrs["bytes"], b"18\0".to_vec());
        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_missing_attribute_fails_request_only() {
        let assets = tempdir().unwrap();
        let config = config(&assets, ECHO_WORKER).with_image_source(ImageSource::RgbImage);
        let mut filter = start(&config);

        let mut object = MemoryObject::default().with(ROWS_ATTR, &2i32.to_ne_bytes());
        let err = filter.evaluate(&mut object).unwrap_err();
        assert_eq!(err.to_string(), "Object attribute '_cols.int' is missing");
        assert!(!err.is_fatal());

        let mut bad = MemoryObject::default()
            .with(ROWS_ATTR, &2i32.to_ne_bytes())
            .with(COLS_ATTR, &2i32.to_ne_bytes())
            .with(RGB_IMAGE_ATTR, &[0u8; 15]);
        assert!(filter.evaluate(&mut bad).is_err());

        // Nothing was sent, so the worker is still in step
        let mut good = MemoryObject::default()
            .with(ROWS_ATTR, &1i32.to_ne_bytes())
            .with(COLS_ATTR, &1i32.to_ne_bytes())
            .with(RGB_IMAGE_ATTR, &[1, 2, 3, 4]);
        assert_eq!(filter.evaluate(&mut good).unwrap(), 4);
        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_framing_error_isolated() {
        let assets = tempdir().unwrap();
        let config = config(&assets, "echo HELLO; exec sleep 60");
        let mut filter = start(&config);

        let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, b"x");
        assert_eq!(filter.evaluate(&mut object).unwrap(), SENTINEL_SCORE);
        assert_eq!(object.result(), Some(-1.0));
        assert!(!filter.worker().is_torn_down());
        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_good_reply_after_framing_error_is_scored() {
        // First reply is malformed, every later one is well formed
        let script = format!(
            "{}{}",
            READ_REQUEST,
            r#"i=0
while read_request; do
    if [ $i -eq 0 ]; then
        printf 'BEGIN\nWHAT\nRESULT\n1\n9\n'
    else
        printf 'BEGIN\nATTR\nK\n1\nn\nV\n1\n%s\nRESULT\n1\n2\n' "$i"
    fi
    i=$((i + 1))
done
"#
        );
        let assets = tempdir().unwrap();
        let config = config(&assets, &script);
        let mut filter = start(&config);

        let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, b"x");
        assert_eq!(filter.evaluate(&mut object).unwrap(), SENTINEL_SCORE);

        for i in 1..=2 {
            let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, b"x");
            assert_eq!(filter.evaluate(&mut object).unwrap(), 2);
            assert_eq!(object.attrs["n"], format!("{}\0", i).into_bytes());
        }
        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_non_utf8_attribute_names_are_dropped() {
        let script = r#"printf 'BEGIN\nATTR\nK\n2\n\377\376\nV\n1\na\nATTR\nK\n2\n\376\377\nV\n1\nb\nATTR\nK\n2\nok\nV\n1\nc\nRESULT\n1\n3\n'; exec sleep 60"#;
        let assets = tempdir().unwrap();
        let config = config(&assets, script);
        let mut filter = start(&config);

        let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, b"x");
        assert_eq!(filter.evaluate(&mut object).unwrap(), 3);
        assert_eq!(object.writes, vec!["ok", RESULT_ATTR]);
        assert_eq!(object.attrs["ok"], b"c\0".to_vec());
        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_framing_error_teardown_policy() {
        let assets = tempdir().unwrap();
        let config = config(&assets, "echo HELLO; exec sleep 60")
            .with_framing_policy(FramingPolicy::TeardownWorker);
        let mut filter = start(&config);
        let root = filter.worker().workspace_root().unwrap().to_path_buf();

        let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, b"x");
        assert_eq!(filter.evaluate(&mut object).unwrap(), SENTINEL_SCORE);
        assert!(filter.worker().is_torn_down());
        assert!(!root.exists());

        let err = filter.evaluate(&mut object).unwrap_err();
        assert!(matches!(err, IjError::WorkerGone(_)));
        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_bare_result_protocol() {
        let assets = tempdir().unwrap();
        let config = config(&assets, "echo -2.75; exec sleep 60")
            .with_protocol(ProtocolVariant::BareResult);
        let mut filter = start(&config);

        let mut object = MemoryObject::default().with(OBJECT_DATA_ATTR, b"x");
        assert_eq!(filter.evaluate(&mut object).unwrap(), -2);
        assert_eq!(object.result(), Some(-2.75));
        assert_eq!(object.writes, vec![RESULT_ATTR]);
        filter.finalize().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_finalize_without_evaluate() {
        let assets = tempdir().unwrap();
        let config = config(&assets, "exec sleep 60");
        let filter = start(&config);
        let root = filter.worker().workspace_root().unwrap().to_path_buf();
        let pid = filter.worker().pid();

        filter.finalize().unwrap();

        assert!(!root.exists());
        assert!(nix::sys::signal::kill(pid, None).is_err());
    }
}
