//! Driver for the external texture-conversion tool: a typed option set
//! turned into an argv, a supervised subprocess, and collated output

mod process;

pub use process::{OutputStream, ProcessHandle};

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use common::*;

#[derive(Debug, Error)]
pub enum TexConvError {
    #[error("More than four input channels")]
    TooManyInputs,

    #[error("No output path set")]
    MissingOutput,

    #[error("Converter exited with code {0}")]
    Failed(i32),

    #[error("Converter timed out")]
    Timeout,

    #[error("Process already finished")]
    AlreadyFinished,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TexConvResult<T> = Result<T, TexConvError>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Container {
    Png,
    Dds,
    Tga,
}

impl Container {
    fn arg(self) -> &'static str {
        match self {
            Container::Png => "png",
            Container::Dds => "dds",
            Container::Tga => "tga",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompressionLevel {
    None,
    Medium,
    High,
}

impl CompressionLevel {
    fn arg(self) -> &'static str {
        match self {
            CompressionLevel::None => "none",
            CompressionLevel::Medium => "medium",
            CompressionLevel::High => "high",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MipmapFilter {
    None,
    Linear,
    Kaiser,
}

impl MipmapFilter {
    fn arg(self) -> &'static str {
        match self {
            MipmapFilter::None => "none",
            MipmapFilter::Linear => "linear",
            MipmapFilter::Kaiser => "kaiser",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TextureUsage {
    Color,
    Linear,
}

impl TextureUsage {
    fn arg(self) -> &'static str {
        match self {
            TextureUsage::Color => "color",
            TextureUsage::Linear => "linear",
        }
    }
}

/// Typed option set for one conversion
#[derive(Clone, Debug)]
pub struct TexConvOptions {
    pub executable: PathBuf,
    /// Up to four input images, addressed as in0..in3
    pub inputs: Vec<PathBuf>,
    /// Channel mapping expressions like "in0.g"
    pub channel_r: Option<String>,
    pub channel_g: Option<String>,
    pub channel_b: Option<String>,
    pub channel_a: Option<String>,
    pub output: PathBuf,
    pub container: Container,
    pub compression: CompressionLevel,
    pub mipmaps: MipmapFilter,
    pub usage: TextureUsage,
    pub max_resolution: Option<u32>,
    pub timeout: Duration,
}

impl TexConvOptions {
    pub fn new(executable: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            inputs: Vec::new(),
            channel_r: None,
            channel_g: None,
            channel_b: None,
            channel_a: None,
            output: output.into(),
            container: Container::Dds,
            compression: CompressionLevel::Medium,
            mipmaps: MipmapFilter::Kaiser,
            usage: TextureUsage::Color,
            max_resolution: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn channels(
        mut self,
        r: impl Into<String>,
        g: impl Into<String>,
        b: impl Into<String>,
        a: impl Into<String>,
    ) -> Self {
        self.channel_r = Some(r.into());
        self.channel_g = Some(g.into());
        self.channel_b = Some(b.into());
        self.channel_a = Some(a.into());
        self
    }

    pub fn to_args(&self) -> TexConvResult<Vec<String>> {
        if self.inputs.len() > 4 {
            return Err(TexConvError::TooManyInputs);
        }
        if self.output.as_os_str().is_empty() {
            return Err(TexConvError::MissingOutput);
        }

        let mut args = Vec::new();
        args.push("-out".to_owned());
        args.push(self.output.display().to_string());
        args.push("-type".to_owned());
        args.push(self.container.arg().to_owned());

        for (i, input) in self.inputs.iter().enumerate() {
            args.push(format!("-in{}", i));
            args.push(input.display().to_string());
        }

        for (flag, mapping) in [
            ("-r", &self.channel_r),
            ("-g", &self.channel_g),
            ("-b", &self.channel_b),
            ("-a", &self.channel_a),
        ] {
            if let Some(mapping) = mapping {
                args.push(flag.to_owned());
                args.push(mapping.clone());
            }
        }

        args.push("-compression".to_owned());
        args.push(self.compression.arg().to_owned());
        args.push("-mipmaps".to_owned());
        args.push(self.mipmaps.arg().to_owned());
        args.push("-usage".to_owned());
        args.push(self.usage.arg().to_owned());

        if let Some(max) = self.max_resolution {
            args.push("-maxRes".to_owned());
            args.push(max.to_string());
        }

        Ok(args)
    }
}

/// Output of a finished conversion
#[derive(Debug, Default)]
pub struct TexConvOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Runs the converter to completion. Exit code 0 is success; everything
/// else (or a timeout) is an error with the collected output logged
pub fn run(options: &TexConvOptions) -> TexConvResult<TexConvOutput> {
    let args = options.to_args()?;
    debug!("invoking texture converter"; "exe" => %options.executable.display(), "args" => ?args);

    let mut command = Command::new(&options.executable);
    command.args(&args);

    let mut handle = ProcessHandle::spawn(&mut command)?;
    let status = handle.wait_with_timeout(options.timeout)?;

    let mut output = TexConvOutput::default();
    for (stream, line) in handle.drain_output() {
        match stream {
            OutputStream::Stdout => output.stdout.push(line),
            OutputStream::Stderr => output.stderr.push(line),
        }
    }

    if status.success() {
        Ok(output)
    } else {
        let code = status.code().unwrap_or(-1);
        error!("texture conversion failed"; "code" => code, "stderr" => ?output.stderr);
        Err(TexConvError::Failed(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_covers_the_option_surface() {
        let options = TexConvOptions::new("TexConv", "textures/out.dds")
            .input("albedo.png")
            .input("roughness.png")
            .channels("in0.r", "in0.g", "in0.b", "in1.r");

        let mut options = options;
        options.max_resolution = Some(2048);
        options.compression = CompressionLevel::High;

        let args = options.to_args().unwrap();
        let joined = args.join(" ");

        assert!(joined.contains("-out textures/out.dds"));
        assert!(joined.contains("-type dds"));
        assert!(joined.contains("-in0 albedo.png"));
        assert!(joined.contains("-in1 roughness.png"));
        assert!(joined.contains("-r in0.r"));
        assert!(joined.contains("-a in1.r"));
        assert!(joined.contains("-compression high"));
        assert!(joined.contains("-mipmaps kaiser"));
        assert!(joined.contains("-usage color"));
        assert!(joined.contains("-maxRes 2048"));
    }

    #[test]
    fn too_many_inputs_are_rejected() {
        let mut options = TexConvOptions::new("TexConv", "out.png");
        for i in 0..5 {
            options = options.input(format!("in{}.png", i));
        }
        assert!(matches!(options.to_args(), Err(TexConvError::TooManyInputs)));
    }

    #[cfg(unix)]
    #[test]
    fn success_and_failure_follow_the_exit_code() {
        common::logging::for_tests();

        // "converter" that succeeds and echoes its args
        let mut ok = TexConvOptions::new("/bin/echo", "out.png");
        ok.container = Container::Png;
        let output = run(&ok).unwrap();
        assert!(output
            .stdout
            .iter()
            .any(|line| line.contains("-out out.png")));

        // and one that always fails
        let fail = TexConvOptions::new("/bin/false", "out.png");
        assert!(matches!(run(&fail), Err(TexConvError::Failed(_))));
    }
}
