use std::path::PathBuf;

use clap::Parser;

use crate::config::Settings;

/// Uploads to and downloads from a cloud drive in parallel chunks.
///
/// Downloads by default: `--path` names a remote file or directory. With
/// `--upload`, `--path` names a local file or directory instead.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Upload `--path` instead of downloading it.
    #[arg(long)]
    pub upload: bool,

    /// User access token. Falls back to `PAN_ACCESS_TOKEN` and the config file.
    #[arg(long = "access_token", alias = "access-token", env = "PAN_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Remote path to download, or local path to upload.
    #[arg(short, long)]
    pub path: String,

    /// Remote folder, below the app root, that uploads are placed in.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Local directory downloads are written to. Defaults to the current one.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Download chunk size in MiB.
    #[arg(long)]
    pub chunk_mb: Option<u64>,

    /// Maximum concurrent network operations across all files.
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Maximum files transferred at the same time.
    #[arg(long)]
    pub concurrent_files: Option<usize>,

    /// A rate limit in bytes per second (e.g., 1048576 for 1MB/s).
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Give up on a chunk after this many attempts. Retries forever if unset.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Read settings from this file instead of the default location.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Hide progress bars.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Layers the flags given on the command line over `settings`.
    pub fn merge_into(&self, mut settings: Settings) -> Settings {
        if self.access_token.is_some() {
            settings.access_token = self.access_token.clone();
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = Some(dir.display().to_string());
        }
        settings.download_chunk_mb = self.chunk_mb.or(settings.download_chunk_mb);
        settings.concurrency = self.concurrency.or(settings.concurrency);
        settings.concurrent_files = self.concurrent_files.or(settings.concurrent_files);
        settings.rate_limit = self.rate_limit.or(settings.rate_limit);
        settings.max_retries = self.max_retries.or(settings.max_retries);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_settings() {
        let args = Args::try_parse_from([
            "pan",
            "--upload",
            "--access_token",
            "cli-token",
            "--path",
            "./photos/",
            "--concurrency",
            "8",
        ])
        .unwrap();
        assert!(args.upload);

        let settings = Settings {
            access_token: Some("file-token".into()),
            concurrency: Some(2),
            rate_limit: Some(1024),
            ..Default::default()
        };
        let merged = args.merge_into(settings);
        assert_eq!(merged.access_token.as_deref(), Some("cli-token"));
        assert_eq!(merged.concurrency, Some(8));
        assert_eq!(merged.rate_limit, Some(1024));
    }

    #[test]
    fn test_path_is_required() {
        assert!(Args::try_parse_from(["pan", "--upload"]).is_err());
    }

    #[test]
    fn test_dashed_token_alias() {
        let args =
            Args::try_parse_from(["pan", "--access-token", "t", "--path", "/apps/x"]).unwrap();
        assert_eq!(args.access_token.as_deref(), Some("t"));
        assert!(!args.upload);
    }
}
