//! Interactive command-line loop: single image, folder batch, parameter comparison.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::{caption_or_message, Captioner, GenerationParams, ImageSource};

/// Extensions picked up in folder mode, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// The lighter setting shown next to the defaults in the comparison step.
pub const COMPARISON_PARAMS: GenerationParams = GenerationParams {
    max_length: 30,
    num_beams: 3,
};

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Regular files in `folder` with an image extension, in directory-listing order.
pub fn list_image_files(folder: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

/// Drives the three prompts against `captioner`.
pub struct BatchSession<'a, C: Captioner + ?Sized, R, W> {
    captioner: &'a mut C,
    params: GenerationParams,
    input: R,
    output: W,
}

impl<'a, C, R, W> BatchSession<'a, C, R, W>
where
    C: Captioner + ?Sized,
    R: BufRead,
    W: Write,
{
    pub fn new(captioner: &'a mut C, params: GenerationParams, input: R, output: W) -> Self {
        Self {
            captioner,
            params,
            input,
            output,
        }
    }

    pub fn run(&mut self) -> io::Result<()> {
        let rule = "=".repeat(60);
        writeln!(self.output, "{rule}")?;
        writeln!(self.output, "Image Caption Generator - Example Usage")?;
        writeln!(self.output, "{rule}")?;

        self.section("📸 Example 1: Single Image Caption Generation")?;
        let path = self.prompt("Enter the path to your image file (or press Enter to skip): ")?;
        self.caption_single(&path)?;

        self.section("📸 Example 2: Batch Processing Multiple Images")?;
        let folder = self.prompt("Enter a folder path containing images (or press Enter to skip): ")?;
        self.caption_folder(&folder)?;

        self.section("📸 Example 3: Custom Generation Parameters")?;
        writeln!(self.output, "\nYou can customize the caption generation with parameters:")?;
        writeln!(self.output, "  - max_length: Maximum length of the caption")?;
        writeln!(self.output, "  - num_beams: Number of beams for beam search (higher = better quality)")?;
        let path = self.prompt("Enter an image path to try custom parameters (or press Enter to skip): ")?;
        self.compare_params(&path)?;

        writeln!(self.output, "\n\n{rule}")?;
        writeln!(self.output, "Example completed!")?;
        writeln!(self.output, "{rule}")?;
        writeln!(self.output, "\n🚀 To launch the web interface, run: blip-caption-web\n")?;
        Ok(())
    }

    pub fn caption_single(&mut self, path: &str) -> io::Result<()> {
        if path.is_empty() {
            return writeln!(self.output, "\n⏭️  Skipped - No image path provided");
        }
        let image_path = Path::new(path);
        if !image_path.exists() {
            writeln!(self.output, "\n❌ Error: File not found at '{path}'")?;
            return writeln!(self.output, "Please make sure the path is correct and try again.");
        }

        writeln!(self.output, "\nGenerating caption for: {path}")?;
        let caption = self.caption_path(image_path, self.params);
        writeln!(self.output, "\n✨ Generated Caption: '{caption}'")
    }

    pub fn caption_folder(&mut self, folder: &str) -> io::Result<()> {
        if folder.is_empty() {
            return writeln!(self.output, "\n⏭️  Skipped - No folder path provided");
        }
        let folder_path = Path::new(folder);
        if !folder_path.is_dir() {
            return writeln!(self.output, "\n❌ Error: Folder not found at '{folder}'");
        }

        let image_files = match list_image_files(folder_path) {
            Ok(files) => files,
            Err(e) => return writeln!(self.output, "\n❌ Error: Could not read folder '{folder}': {e}"),
        };
        if image_files.is_empty() {
            return writeln!(self.output, "\n❌ No image files found in '{folder}'");
        }

        let total = image_files.len();
        writeln!(self.output, "\nFound {total} images. Generating captions...\n")?;
        for (i, image_path) in image_files.iter().enumerate() {
            let file_name = image_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            writeln!(self.output, "[{}/{}] {}", i + 1, total, file_name)?;
            // a file that fails to decode gets its error line; the batch goes on
            let caption = self.caption_path(image_path, self.params);
            writeln!(self.output, "    Caption: '{caption}'\n")?;
        }
        Ok(())
    }

    pub fn compare_params(&mut self, path: &str) -> io::Result<()> {
        if path.is_empty() {
            return writeln!(self.output, "\n⏭️  Skipped - No image path provided");
        }
        let image_path = Path::new(path);
        if !image_path.exists() {
            return writeln!(self.output, "\n❌ Error: File not found at '{path}'");
        }

        for (label, params) in [("default", self.params), ("custom", COMPARISON_PARAMS)] {
            writeln!(
                self.output,
                "\nGenerating with {} parameters (max_length={}, num_beams={}):",
                label, params.max_length, params.num_beams
            )?;
            let caption = self.caption_path(image_path, params);
            writeln!(self.output, "  Caption: '{caption}'")?;
        }
        Ok(())
    }

    fn caption_path(&mut self, path: &Path, params: GenerationParams) -> String {
        let result = self.captioner.caption_source(ImageSource::Path(path.to_path_buf()), &params);
        if let Err(e) = &result {
            tracing::warn!("Captioning {} failed: {}", path.display(), e);
        }
        caption_or_message(result)
    }

    fn section(&mut self, title: &str) -> io::Result<()> {
        writeln!(self.output, "\n\n{title}")?;
        writeln!(self.output, "{}", "-".repeat(60))
    }

    /// Empty input and end of input both mean "skip".
    fn prompt(&mut self, message: &str) -> io::Result<String> {
        write!(self.output, "\n{message}")?;
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

pub const INTERRUPT_NOTICE: &str = "\n\n⚠️  Interrupted by user. Exiting...";

pub fn write_interrupt_notice<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "{INTERRUPT_NOTICE}")?;
    out.flush()
}

/// Ctrl-C prints a notice and exits cleanly.
///
/// The handler runs on its own thread and takes the stdout lock, so a
/// `BatchSession` must be given `io::stdout()` itself, never a held
/// `StdoutLock`, or the handler blocks while a prompt waits for input.
pub fn install_interrupt_handler() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        let _ = write_interrupt_notice(&mut io::stdout().lock());
        std::process::exit(0);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_png, FakeCaptioner};
    use std::io::{BufReader, Cursor, Read};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn run_session(captioner: &mut FakeCaptioner, input: &str) -> String {
        let mut output = Vec::new();
        BatchSession::new(captioner, GenerationParams::default(), Cursor::new(input.to_string()), &mut output)
            .run()
            .unwrap();
        String::from_utf8(output).unwrap()
    }

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, sample_png(4, 4)).unwrap();
        path
    }

    /// Input that blocks on the first read until released, then reports EOF.
    struct HeldInput {
        waiting: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl Read for HeldInput {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.waiting.send(());
            let _ = self.release.recv();
            Ok(0)
        }
    }

    #[test]
    fn test_interrupt_notice_text() {
        let mut out = Vec::new();
        write_interrupt_notice(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "\n\n⚠️  Interrupted by user. Exiting...\n");
    }

    #[test]
    fn test_interrupt_notice_not_blocked_by_waiting_prompt() {
        let (waiting_tx, waiting_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let input = BufReader::new(HeldInput {
            waiting: waiting_tx,
            release: release_rx,
        });

        // same wiring as the CLI binary: stdin-like input, the process stdout
        let session = thread::spawn(move || {
            let mut fake = FakeCaptioner::new();
            BatchSession::new(&mut fake, GenerationParams::default(), input, io::stdout()).run()
        });
        waiting_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // what the Ctrl-C handler does, from another thread
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let result = write_interrupt_notice(&mut io::stdout().lock());
            let _ = done_tx.send(result.is_ok());
        });
        let printed = done_rx.recv_timeout(Duration::from_secs(5));

        drop(release_tx);
        session.join().unwrap().unwrap();
        assert_eq!(printed, Ok(true), "notice was blocked while the prompt waited for input");
    }

    #[test]
    fn test_image_extension_filter() {
        assert!(is_image_file(Path::new("dog.jpg")));
        assert!(is_image_file(Path::new("DOG.JPEG")));
        assert!(is_image_file(Path::new("a/b/cat.WebP")));
        assert!(!is_image_file(Path::new("notes.txt")));
        assert!(!is_image_file(Path::new("jpg")));
        assert!(!is_image_file(Path::new("archive.png.zip")));
    }

    #[test]
    fn test_all_steps_skipped_on_empty_input() {
        let mut fake = FakeCaptioner::new();
        let out = run_session(&mut fake, "\n\n\n");
        assert_eq!(out.matches("Skipped").count(), 3);
        assert!(out.contains("Example completed!"));
        assert_eq!(fake.calls(), 0);
    }

    #[test]
    fn test_end_of_input_skips_remaining_steps() {
        let mut fake = FakeCaptioner::new();
        let out = run_session(&mut fake, "");
        assert_eq!(out.matches("Skipped").count(), 3);
    }

    #[test]
    fn test_missing_file_does_not_invoke_model() {
        let mut fake = FakeCaptioner::new();
        let out = run_session(&mut fake, "/no/such/dog.jpg\n\n/also/missing.png\n");
        assert!(out.contains("❌ Error: File not found at '/no/such/dog.jpg'"));
        assert!(out.contains("❌ Error: File not found at '/also/missing.png'"));
        assert_eq!(fake.calls(), 0);
    }

    #[test]
    fn test_single_image_caption() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "dog.png");

        let mut fake = FakeCaptioner::new();
        let out = run_session(&mut fake, &format!("{}\n\n\n", path.display()));
        assert!(out.contains("✨ Generated Caption: 'a 4x4 test image'"));
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_folder_captions_only_matching_files_in_listing_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.JPG", "c.webp"] {
            write_png(dir.path(), name);
        }
        std::fs::write(dir.path().join("readme.txt"), "not an image").unwrap();
        std::fs::write(dir.path().join("data.csv"), "1,2,3").unwrap();
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let expected_order: Vec<String> = list_image_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(expected_order.len(), 3);

        let mut fake = FakeCaptioner::new();
        let out = run_session(&mut fake, &format!("\n{}\n\n", dir.path().display()));

        assert_eq!(fake.calls(), 3);
        assert_eq!(out.matches("    Caption: ").count(), 3);
        assert!(out.contains("Found 3 images"));
        let positions: Vec<usize> = expected_order
            .iter()
            .enumerate()
            .map(|(i, name)| out.find(&format!("[{}/3] {}", i + 1, name)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(!out.contains("readme.txt"));
    }

    #[test]
    fn test_undecodable_file_in_folder_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"garbage").unwrap();
        write_png(dir.path(), "good.png");

        let mut fake = FakeCaptioner::new();
        let out = run_session(&mut fake, &format!("\n{}\n\n", dir.path().display()));

        assert_eq!(out.matches("    Caption: ").count(), 2);
        assert!(out.contains("Caption: 'Error generating caption: failed to decode image"));
        assert!(out.contains("Caption: 'a 4x4 test image'"));
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_empty_folder_and_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeCaptioner::new();

        let out = run_session(&mut fake, &format!("\n{}\n\n", dir.path().display()));
        assert!(out.contains("❌ No image files found in"));

        let out = run_session(&mut fake, "\n/no/such/folder\n\n");
        assert!(out.contains("❌ Error: Folder not found at '/no/such/folder'"));
        assert_eq!(fake.calls(), 0);
    }

    #[test]
    fn test_parameter_comparison_runs_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "dog.png");

        let mut fake = FakeCaptioner::new();
        let out = run_session(&mut fake, &format!("\n\n{}\n", path.display()));

        assert!(out.contains("default parameters (max_length=50, num_beams=5)"));
        assert!(out.contains("custom parameters (max_length=30, num_beams=3)"));
        assert_eq!(out.matches("  Caption: 'a 4x4 test image'").count(), 2);
        assert_eq!(
            fake.params_seen(),
            vec![GenerationParams::default(), COMPARISON_PARAMS]
        );
    }
}
