use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytesize::ByteSize;
use clap::{Args, Parser, Subcommand};

use lomob::clients::gdrive::{self, DriveClient};
use lomob::clients::s3::S3Client;
use lomob::clients::{DocStore, ObjectStore, CONTENT_TYPE_BINARY};
use lomob::{
    catalog::Catalog, crypto, error::Error, hash, packer, scanner, smallfile, uploader,
    IsoStatus, MkisofsWriter, Result, UploadOptions,
};

#[derive(Parser)]
#[command(name = "lomob", version, about = "Backup files to remote storage with a 2 stage approach")]
struct Cli {
    /// Filename of the catalog database
    #[arg(long, global = true, default_value = "lomob.db")]
    db: PathBuf,
    /// off, error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct AwsOpts {
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    aws_access_key_id: String,
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    aws_secret_access_key: String,
    #[arg(long, env = "AWS_DEFAULT_REGION", default_value = "us-east-1")]
    aws_bucket_region: String,
    #[arg(long, default_value = "lomorage")]
    aws_bucket_name: String,
    /// Custom endpoint for S3-compatible stores (MinIO, R2, …)
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long, default_value = "STANDARD_IA")]
    storage_class: String,
    /// In-band retries per part upload
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

impl AwsOpts {
    fn client(&self) -> Result<S3Client> {
        S3Client::new(
            &self.aws_access_key_id,
            &self.aws_secret_access_key,
            &self.aws_bucket_region,
            self.endpoint.as_deref(),
            self.retries,
        )
    }
}

#[derive(Args, Clone)]
struct KeyOpts {
    /// Master passphrase; prompted when absent
    #[arg(long, env = "LOMOB_MASTER_KEY", hide_env_values = true)]
    encrypt_key: Option<String>,
    /// Upload plaintext instead of ciphertext
    #[arg(long)]
    no_encrypt: bool,
}

impl KeyOpts {
    fn master_key(&self) -> Result<Option<String>> {
        if self.no_encrypt {
            return Ok(None);
        }
        if let Some(k) = &self.encrypt_key {
            return Ok(Some(k.clone()));
        }
        Ok(Some(prompt_master_key()?))
    }
}

#[derive(Args, Clone)]
struct GcloudOpts {
    /// OAuth client credentials file
    #[arg(long, default_value = "credentials.json")]
    cred: PathBuf,
    /// OAuth token file
    #[arg(long, default_value = "token.json")]
    token: PathBuf,
    /// Remote root folder
    #[arg(long, default_value = "lomorage")]
    folder: String,
}

impl GcloudOpts {
    fn client(&self) -> Result<DriveClient> {
        DriveClient::new(&self.cred, &self.token)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory tree into the catalog
    Scan {
        dir: PathBuf,
        #[arg(long, default_value_t = 20)]
        threads: usize,
        /// Comma-separated file names to skip
        #[arg(long, default_value = ".DS_Store,._.DS_Store,Thumbs.db")]
        ignore_files: String,
        /// Comma-separated directory names to skip
        #[arg(long, default_value = ".,..,.thumbnails")]
        ignore_dirs: String,
    },
    /// ISO volume operations
    Iso {
        #[command(subcommand)]
        command: IsoCommands,
    },
    /// Upload ISOs or individual files
    Upload {
        #[command(subcommand)]
        command: UploadCommands,
    },
    /// Fetch one object back and decrypt it
    Restore {
        #[command(subcommand)]
        command: RestoreCommands,
    },
    /// Catalog and cloud listings
    List {
        #[command(subcommand)]
        command: ListCommands,
    },
    /// Odds and ends
    Util {
        #[command(subcommand)]
        command: UtilCommands,
    },
}

#[derive(Subcommand)]
enum IsoCommands {
    /// Pack un-backedup files into ISO volumes
    Create {
        /// Target plaintext size per volume
        #[arg(long, default_value = "5GiB")]
        iso_size: String,
        /// Explicit output filename (one-shot)
        name: Option<String>,
    },
    /// List catalogued ISOs
    List,
    /// Print the file tree inside one ISO
    Dump { name: String },
    /// Upload ISOs via multipart (same as `upload iso`)
    Upload(UploadIsoArgs),
}

#[derive(Args, Clone)]
struct UploadIsoArgs {
    /// ISO filenames; with --all every ISO not yet uploaded
    names: Vec<String>,
    #[arg(long)]
    all: bool,
    #[arg(long, default_value = "16MiB")]
    part_size: String,
    /// Keep a local copy of every uploaded part
    #[arg(long)]
    save_parts: bool,
    /// Reset recorded upload state and start over
    #[arg(long)]
    force: bool,
    /// Parallel part uploads (plaintext mode only)
    #[arg(long, default_value_t = 1)]
    threads: usize,
    #[command(flatten)]
    aws: AwsOpts,
    #[command(flatten)]
    key: KeyOpts,
}

#[derive(Subcommand)]
enum UploadCommands {
    /// Multipart-upload ISO volumes to the object store
    Iso(UploadIsoArgs),
    /// Mirror un-packed files into the document store
    Files {
        #[command(flatten)]
        gcloud: GcloudOpts,
        #[command(flatten)]
        key: KeyOpts,
    },
}

#[derive(Subcommand)]
enum RestoreCommands {
    /// Download an object from the object store and decrypt it
    Aws {
        key: String,
        #[arg(long)]
        output: PathBuf,
        #[command(flatten)]
        aws: AwsOpts,
        #[command(flatten)]
        crypt: KeyOpts,
    },
    /// Download a file from the document store and decrypt it
    Gdrive {
        /// Path below the root folder, e.g. `roots_photos/2024/a.jpg`
        path: String,
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        gcloud: GcloudOpts,
        #[command(flatten)]
        crypt: KeyOpts,
    },
}

#[derive(Subcommand)]
enum ListCommands {
    /// Catalogued files at least this big
    Bigfiles {
        #[arg(long, default_value = "50MiB")]
        size: String,
    },
    /// Catalogued directories with aggregates
    Dirs,
    /// Catalogued ISO volumes
    Isos,
    /// Contents of the document-store root folder
    Gdrive {
        #[command(flatten)]
        gcloud: GcloudOpts,
    },
    /// Files not yet packed or mirrored
    Files,
}

#[derive(Subcommand)]
enum UtilCommands {
    /// Encrypt a local file
    Encrypt {
        input: PathBuf,
        output: Option<PathBuf>,
        #[command(flatten)]
        key: KeyOpts,
    },
    /// Decrypt a local file
    Decrypt {
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        key: KeyOpts,
    },
    /// Per-part SHA-256 digests of a local file
    Parts {
        input: PathBuf,
        #[arg(long, default_value = "16MiB")]
        part_size: String,
        /// 0 prints every part plus the overall digest
        #[arg(long, default_value_t = 0)]
        part_number: usize,
    },
    /// In-progress multipart uploads in the bucket
    ListInprogressUpload {
        #[command(flatten)]
        aws: AwsOpts,
    },
    /// Abort one upload, or all uploads for a key
    AbortUpload {
        upload_key: String,
        upload_id: Option<String>,
        #[command(flatten)]
        aws: AwsOpts,
    },
    /// One-shot PUT of a local file to the object store
    UploadS3 {
        input: PathBuf,
        #[command(flatten)]
        aws: AwsOpts,
    },
    /// Show the salt header of an encrypted file
    CheckHeader { input: PathBuf },
    /// Run the OAuth consent flow for the document store
    GcloudAuth {
        #[command(flatten)]
        gcloud: GcloudOpts,
    },
    /// Refresh the stored OAuth token
    GcloudAuthRefresh {
        #[command(flatten)]
        gcloud: GcloudOpts,
    },
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.clone()),
    )
    .init();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || {
            log::warn!("interrupt received, finishing current step");
            cancel.store(true, Ordering::Relaxed);
        });
    }

    if let Err(e) = run(cli, &cancel) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli, cancel: &AtomicBool) -> Result<()> {
    match cli.command {
        Commands::Scan { dir, threads, ignore_files, ignore_dirs } => {
            let opts = scanner::ScanOptions {
                workers:      threads,
                ignore_files: split_set(&ignore_files),
                ignore_dirs:  split_set(&ignore_dirs),
            };
            let summary = scanner::scan_directory(&cli.db, &dir, &opts, cancel)?;
            println!(
                "Scan finished: {} new files, {} already catalogued, {} errors",
                summary.files_added, summary.files_skipped, summary.errors
            );
        }

        Commands::Iso { command } => match command {
            IsoCommands::Create { iso_size, name } => {
                let mut catalog = Catalog::open(&cli.db)?;
                let writer = MkisofsWriter::detect()?;
                packer::mk_iso(&mut catalog, &writer, parse_size(&iso_size)?, name)?;
            }
            IsoCommands::List => list_isos(&cli.db)?,
            IsoCommands::Dump { name } => {
                let mut catalog = Catalog::open(&cli.db)?;
                print!("{}", uploader::gen_tree_in_iso(&mut catalog, &name)?);
            }
            IsoCommands::Upload(args) => upload_isos(&cli.db, args, cancel)?,
        },

        Commands::Upload { command } => match command {
            UploadCommands::Iso(args) => upload_isos(&cli.db, args, cancel)?,
            UploadCommands::Files { gcloud, key } => {
                let mut catalog = Catalog::open(&cli.db)?;
                let mut client = gcloud.client()?;
                let master_key = key.master_key()?;
                smallfile::upload_files(
                    &mut catalog,
                    &mut client,
                    &gcloud.folder,
                    master_key.as_deref(),
                    cancel,
                )?;
            }
        },

        Commands::Restore { command } => match command {
            RestoreCommands::Aws { key, output, aws, crypt } => {
                let client = aws.client()?;
                let mut body = client.get(&aws.aws_bucket_name, &key)?;
                let out = File::create(&output)?;
                match crypt.master_key()? {
                    Some(pass) => crypto::decrypt_file(&mut body, out, &pass)?,
                    None => {
                        let mut out = out;
                        io::copy(&mut body, &mut out)?;
                    }
                }
                println!("Restored {key} to {}", output.display());
            }
            RestoreCommands::Gdrive { path, output, gcloud, crypt } => {
                restore_gdrive(&gcloud, &path, output.as_deref(), &crypt)?;
            }
        },

        Commands::List { command } => match command {
            ListCommands::Bigfiles { size } => {
                let mut catalog = Catalog::open(&cli.db)?;
                let min = parse_size(&size)?;
                println!("{:<8} {:>12}  Path", "ID", "Size");
                for f in catalog.list_files_by_min_size(min as i64)? {
                    println!("{:<8} {:>12}  {}", f.id, ByteSize(f.size as u64).to_string(), f.name);
                }
            }
            ListCommands::Dirs => {
                let mut catalog = Catalog::open(&cli.db)?;
                println!(
                    "{:<6} {:>6} {:>7} {:>12}  Path",
                    "ID", "Dirs", "Files", "TotalSize"
                );
                for d in catalog.list_dirs()? {
                    println!(
                        "{:<6} {:>6} {:>7} {:>12}  {}",
                        d.id,
                        d.child_dir_count,
                        d.file_count,
                        ByteSize(d.total_file_size as u64).to_string(),
                        d.path
                    );
                }
            }
            ListCommands::Isos => list_isos(&cli.db)?,
            ListCommands::Gdrive { gcloud } => {
                let mut client = gcloud.client()?;
                let Some((root_id, _)) = client.get_file_id(&gcloud.folder, None)? else {
                    println!("folder '{}' not found", gcloud.folder);
                    return Ok(());
                };
                let (folders, files) = client.list(&root_id)?;
                for d in folders {
                    println!("{:<44} {:>12}  {}/", d.id, "-", d.name);
                }
                for f in files {
                    println!("{:<44} {:>12}  {}", f.id, ByteSize(f.size as u64).to_string(), f.name);
                }
            }
            ListCommands::Files => {
                let mut catalog = Catalog::open(&cli.db)?;
                println!("{:<8} {:>12}  Path", "ID", "Size");
                for f in catalog.list_files_not_in_iso_and_cloud()? {
                    println!("{:<8} {:>12}  {}", f.id, ByteSize(f.size as u64).to_string(), f.name);
                }
            }
        },

        Commands::Util { command } => run_util(&cli.db, command, cancel)?,
    }
    Ok(())
}

fn run_util(_db: &Path, command: UtilCommands, _cancel: &AtomicBool) -> Result<()> {
    match command {
        UtilCommands::Encrypt { input, output, key } => {
            let output =
                output.unwrap_or_else(|| PathBuf::from(format!("{}.enc", input.display())));
            let pass = key
                .master_key()?
                .ok_or_else(|| Error::UserInput("encrypt needs a passphrase".into()))?;
            println!("Start encrypt '{}', and save output to '{}'", input.display(), output.display());
            crypto::encrypt_file(File::open(&input)?, File::create(&output)?, &pass)?;
            println!("Finish encryption!");
        }
        UtilCommands::Decrypt { input, output, key } => {
            let pass = key
                .master_key()?
                .ok_or_else(|| Error::UserInput("decrypt needs a passphrase".into()))?;
            let src = File::open(&input)?;
            match output {
                Some(path) => crypto::decrypt_file(src, File::create(path)?, &pass)?,
                None => crypto::decrypt_file(src, io::stdout().lock(), &pass)?,
            }
            println!("Finish decryption!");
        }
        UtilCommands::Parts { input, part_size, part_number } => {
            let parts = hash::hash_parts(&input, parse_size(&part_size)?)?;
            if part_number == 0 {
                for (i, p) in parts.iter().enumerate() {
                    println!("Part {}: {}", i + 1, hash::to_base64(p));
                }
                println!("Overall: {}", hash::concat_base64(&parts));
            } else {
                let p = parts
                    .get(part_number - 1)
                    .ok_or_else(|| Error::UserInput(format!("file has {} parts", parts.len())))?;
                println!("Part {}: {}", part_number, hash::to_base64(p));
            }
        }
        UtilCommands::ListInprogressUpload { aws } => {
            let client = aws.client()?;
            println!("{:<48} {:<40} UploadTime", "UploadKey", "UploadID");
            for r in uploader::list_inprogress_uploads(&client, &aws.aws_bucket_name)? {
                println!(
                    "{:<48} {:<40} {}",
                    r.key,
                    r.upload_id,
                    r.initiated.map(|t| t.to_string()).unwrap_or_default()
                );
            }
        }
        UtilCommands::AbortUpload { upload_key, upload_id, aws } => {
            let client = aws.client()?;
            uploader::abort_upload(
                &client,
                &aws.aws_bucket_name,
                &upload_key,
                upload_id.as_deref(),
            )?;
        }
        UtilCommands::UploadS3 { input, aws } => {
            let client = aws.client()?;
            let body = std::fs::read(&input)?;
            let checksum = hash::to_base64(&hash::hash_bytes(&body));
            let key = input
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| Error::UserInput("input has no file name".into()))?;
            client.put(
                &aws.aws_bucket_name,
                &key,
                &body,
                &checksum,
                CONTENT_TYPE_BINARY,
                &aws.storage_class,
            )?;
            println!("{key} is uploaded to bucket {}", aws.aws_bucket_name);
        }
        UtilCommands::CheckHeader { input } => {
            let mut f = File::open(&input)?;
            let mut salt = [0u8; crypto::SALT_LEN];
            f.read_exact(&mut salt).map_err(|_| Error::ShortHeader)?;
            println!("salt: {}", hex::encode(salt));
        }
        UtilCommands::GcloudAuth { gcloud } => {
            println!("Open the following URL and paste the authorization code:");
            println!("{}", gdrive::consent_url(&gcloud.cred)?);
            print!("Code: ");
            io::stdout().flush()?;
            let mut code = String::new();
            io::stdin().read_line(&mut code)?;
            gdrive::exchange_code(&gcloud.cred, &gcloud.token, code.trim())?;
            println!("Token saved to {}", gcloud.token.display());
        }
        UtilCommands::GcloudAuthRefresh { gcloud } => {
            let mut client = gcloud.client()?;
            client.force_refresh()?;
            println!("Token refreshed");
        }
    }
    Ok(())
}

fn upload_isos(db: &Path, args: UploadIsoArgs, cancel: &AtomicBool) -> Result<()> {
    let mut catalog = Catalog::open(db)?;

    let names: Vec<String> = if args.all {
        catalog
            .list_isos()?
            .into_iter()
            .filter(|iso| iso.status != Some(IsoStatus::Uploaded))
            .map(|iso| iso.name)
            .collect()
    } else if args.names.is_empty() {
        return Err(Error::UserInput(
            "supply at least one iso file name, or --all to upload every pending ISO".into(),
        ));
    } else {
        args.names.clone()
    };

    let client = args.aws.client()?;
    let opts = UploadOptions {
        region:        args.aws.aws_bucket_region.clone(),
        bucket:        args.aws.aws_bucket_name.clone(),
        storage_class: args.aws.storage_class.clone(),
        part_size:     parse_size(&args.part_size)?,
        master_key:    args.key.master_key()?,
        save_parts:    args.save_parts,
        force:         args.force,
        threads:       args.threads,
    };

    for name in names {
        uploader::upload_iso(&mut catalog, &client, &opts, &name, cancel)?;
    }
    Ok(())
}

fn restore_gdrive(
    gcloud: &GcloudOpts,
    path: &str,
    output: Option<&Path>,
    crypt: &KeyOpts,
) -> Result<()> {
    let mut client = gcloud.client()?;

    let mut id = client
        .get_file_id(&gcloud.folder, None)?
        .map(|(id, _)| id)
        .ok_or_else(|| Error::NotFound(format!("folder {}", gcloud.folder)))?;
    for name in path.split('/').filter(|p| !p.is_empty()) {
        id = client
            .get_file_id(name, Some(&id))?
            .map(|(id, _)| id)
            .ok_or_else(|| Error::NotFound(format!("{name} under {}", gcloud.folder)))?;
    }

    let mut body = client.download(&id)?;
    let out: Box<dyn Write> = match output {
        Some(p) => Box::new(File::create(p)?),
        None => Box::new(io::stdout().lock()),
    };
    match crypt.master_key()? {
        Some(pass) => crypto::decrypt_file(&mut body, out, &pass)?,
        None => {
            let mut out = out;
            io::copy(&mut body, &mut out)?;
        }
    }
    Ok(())
}

fn list_isos(db: &Path) -> Result<()> {
    let mut catalog = Catalog::open(db)?;
    println!("{:<4} {:<34} {:>12} {:<24} Create Time", "ID", "Name", "Size", "Status");
    for iso in catalog.list_isos()? {
        println!(
            "{:<4} {:<34} {:>12} {:<24} {}",
            iso.id,
            iso.name,
            ByteSize(iso.size as u64).to_string(),
            iso.status.map(|s| s.to_string()).unwrap_or_default(),
            iso.create_time.map(|t| t.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

fn prompt_master_key() -> Result<String> {
    let first = rpassword::prompt_password("Enter Master Key: ")?;
    let second = rpassword::prompt_password("Enter Master Key Again: ")?;
    if first != second {
        return Err(Error::UserInput("got two different keys".into()));
    }
    Ok(first)
}

fn parse_size(s: &str) -> Result<u64> {
    s.parse::<ByteSize>()
        .map(|b| b.as_u64())
        .map_err(|e| Error::UserInput(format!("bad size '{s}': {e}")))
}

fn split_set(s: &str) -> HashSet<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
