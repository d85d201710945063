//! Command drivers: build an index, diff a local file against one, patch.
//!
//! Everything here is orchestration — opening files or URLs, splitting the
//! local file into scan sections, moving spans between the merger and the
//! patcher, and temp-file handling when the output would overwrite the
//! local file. The core pipeline lives in the library modules.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::checksum::{ChecksumGenerator, HashVerifier};
use crate::index::ChecksumIndex;
use crate::indexfile::{self, LoadedIndex};
use crate::merger::{MatchMerger, SortedSpanList};
use crate::patcher::{patch_sequentially, FoundBlockSpan, MissingBlockSpan};
use crate::resolver::FixedSizeBlockResolver;
use crate::scanner::Scanner;
use crate::source::file::read_seeker_block_source;
use crate::source::http::http_block_source;
use crate::source::BlockSourceBase;
use crate::util::is_same_file;
use crate::{BlockSyncError, Result};

const MB: u64 = 1024 * 1024;

/// Files below this size are scanned on a single section.
const SINGLE_SECTION_THRESHOLD: u64 = MB;

/// Read-ahead budget handed to the patcher.
const MAX_PATCHING_BLOCK_STORAGE: u64 = 20 * MB;

/// Buffer in front of each section's file handle.
const SECTION_READ_BUFFER: usize = MB as usize;

/// Write a `.gosync` index next to `path`. Returns the index path.
pub fn build(path: &Path, block_size: u32) -> Result<PathBuf> {
    if block_size == 0 {
        return Err(BlockSyncError::Config("block size must be non-zero".into()));
    }

    let input = File::open(path)?;
    let file_size = input.metadata()?.len();

    let out_path = path.with_extension("gosync");
    let mut output = BufWriter::new(File::create(&out_path)?);

    indexfile::build_index_file(
        BufReader::new(input),
        &mut output,
        block_size,
        file_size,
    )?;
    output.flush()?;

    info!(
        "wrote {} ({} blocks of {} bytes)",
        out_path.display(),
        file_size.div_ceil(u64::from(block_size)),
        block_size,
    );

    Ok(out_path)
}

/// Compare `local` against an index and print match statistics.
pub fn diff(local: &Path, index_locator: &str, num_matchers: usize) -> Result<()> {
    let start = Instant::now();

    let loaded = open_index(index_locator)?;
    println!("Blocksize: {}", loaded.header.block_size);
    println!("Weak hash count: {}", loaded.index.weak_count());

    let local_file = File::open(local)?;
    let local_size = local_file.metadata()?.len();
    drop(local_file);

    let scanner = Arc::new(Scanner::new());
    let merger = Arc::new(MatchMerger::new());
    let index = Arc::new(loaded.index);

    multithreaded_matching(
        local,
        &index,
        local_size,
        num_matchers,
        loaded.header.block_size,
        &scanner,
        &merger,
    )?;

    let merged = merger.get_merged_spans();
    let block_size = u64::from(loaded.header.block_size);

    let matched_blocks: u64 = merged.iter().map(|s| u64::from(s.block_count())).sum();
    println!("Comparisons: {}", scanner.comparisons());
    println!("Weak hash hits: {}", scanner.weak_hash_hits());
    if scanner.comparisons() > 0 {
        println!(
            "Weak hit rate: {:.2}%",
            100.0 * scanner.weak_hash_hits() as f64 / scanner.comparisons() as f64
        );
    }
    println!("Strong hash hits: {}", scanner.strong_hash_hits());
    if scanner.weak_hash_hits() > 0 {
        println!(
            "Weak hash error rate: {:.2}%",
            100.0 * (scanner.weak_hash_hits() - scanner.strong_hash_hits()) as f64
                / scanner.weak_hash_hits() as f64
        );
    }
    println!("Total matched bytes: {}", matched_blocks * block_size);
    println!("Total matched blocks: {}", matched_blocks);
    println!("Index blocks: {}", index.block_count());

    if index.block_count() > 0 {
        let missing = merged.missing_spans(index.block_count() as u32 - 1);
        let missing_blocks: u64 = missing.iter().map(|s| u64::from(s.block_count())).sum();
        println!("Approximate missing bytes: {}", missing_blocks * block_size);
    }

    println!("Time taken: {:.2?}", start.elapsed());
    Ok(())
}

/// Reconstruct the reference described by `index_locator`, reusing blocks of
/// `local` and fetching the rest from `reference` (a path or http(s) URL).
/// Patches through a sibling temp file when the output aliases the local
/// file.
pub fn patch(
    local: &Path,
    index_locator: &str,
    reference: &str,
    output: Option<&Path>,
    num_matchers: usize,
) -> Result<()> {
    let loaded = open_index(index_locator)?;
    let header = loaded.header;
    let block_size = u64::from(header.block_size);

    let local_file = File::open(local)?;
    let local_size = local_file.metadata()?.len();

    let out_path = output.unwrap_or(local);
    let use_tempfile = is_same_file(local, out_path)?;

    if loaded.index.block_count() == 0 {
        // an empty reference patches to an empty file
        File::create(out_path)?;
        return Ok(());
    }

    let scanner = Arc::new(Scanner::new());
    let merger = Arc::new(MatchMerger::new());
    let index = Arc::new(loaded.index);

    multithreaded_matching(
        local,
        &index,
        local_size,
        num_matchers,
        header.block_size,
        &scanner,
        &merger,
    )?;

    let merged = merger.get_merged_spans();
    let missing = merged.missing_spans(index.block_count() as u32 - 1);
    debug!(
        "{} matched spans, {} missing spans",
        merged.len(),
        missing.len()
    );

    let found_spans = to_found_spans(&merged, block_size);
    let missing_spans = to_missing_spans(&missing, block_size);

    let resolver = FixedSizeBlockResolver::with_file_size(block_size, header.file_size);
    let source = if is_url(reference) {
        http_block_source(
            reference,
            num_matchers.max(1),
            resolver,
            Some(Box::new(HashVerifier::new(
                header.block_size as usize,
                loaded.checksums,
            ))),
        )
    } else {
        read_seeker_block_source(File::open(reference)?, resolver)
    };

    let write_path = if use_tempfile {
        sibling_temp_path(out_path)
    } else {
        out_path.to_path_buf()
    };

    let result = write_patched_file(
        local_file,
        &source,
        &missing_spans,
        &found_spans,
        header.file_size,
        &write_path,
    );

    match result {
        Ok(()) => {
            if use_tempfile {
                std::fs::rename(&write_path, out_path)?;
            }
            info!(
                "downloaded {} of {} bytes",
                source.bytes_requested(),
                header.file_size,
            );
            let _ = source.close();
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&write_path);
            let _ = source.close();
            Err(e)
        }
    }
}

fn write_patched_file(
    local_file: File,
    source: &BlockSourceBase,
    missing: &[MissingBlockSpan],
    found: &[FoundBlockSpan],
    reference_size: u64,
    write_path: &Path,
) -> Result<()> {
    let out_file = File::create(write_path)?;

    let progress = ProgressBar::new(reference_size);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("static progress template"),
    );

    let mut local_reader = BufReader::new(local_file);
    let mut writer = progress.wrap_write(BufWriter::new(out_file));

    patch_sequentially(
        &mut local_reader,
        source,
        missing,
        found,
        reference_size,
        MAX_PATCHING_BLOCK_STORAGE,
        &mut writer,
    )?;

    writer.flush()?;
    progress.finish_and_clear();
    Ok(())
}

fn to_found_spans(spans: &SortedSpanList, block_size: u64) -> Vec<FoundBlockSpan> {
    spans
        .iter()
        .map(|s| FoundBlockSpan {
            start_block: s.start_block,
            end_block: s.end_block,
            block_size,
            match_offset: s.comparison_start_offset,
        })
        .collect()
}

fn to_missing_spans(spans: &SortedSpanList, block_size: u64) -> Vec<MissingBlockSpan> {
    spans
        .iter()
        .map(|s| MissingBlockSpan {
            start_block: s.start_block,
            end_block: s.end_block,
            block_size,
        })
        .collect()
}

/// Run scan sections over `local_path` on a thread pool, feeding the merger.
/// Sections after the first start one block early so windows can align
/// across the seams; the merger drops the duplicated matches.
fn multithreaded_matching(
    local_path: &Path,
    index: &Arc<ChecksumIndex>,
    local_file_size: u64,
    num_matchers: usize,
    block_size: u32,
    scanner: &Arc<Scanner>,
    merger: &Arc<MatchMerger>,
) -> Result<()> {
    let sections = if local_file_size < SINGLE_SECTION_THRESHOLD {
        1
    } else {
        num_matchers.max(1)
    };

    let block_size_u64 = u64::from(block_size);
    let mut section_size = local_file_size / sections as u64;
    section_size += block_size_u64 - (section_size % block_size_u64);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(sections)
        .build()
        .map_err(|e| BlockSyncError::Config(format!("failed to build scan pool: {}", e)))?;

    // open and position every section handle before spawning anything, so
    // setup errors surface on the caller
    let mut section_readers = Vec::with_capacity(sections);
    for i in 0..sections as u64 {
        let nominal = section_size * i;
        let (offset, length) = if i == 0 {
            (0, section_size)
        } else {
            (nominal - block_size_u64, section_size + block_size_u64)
        };

        let mut file = File::open(local_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let reader = BufReader::with_capacity(SECTION_READ_BUFFER, file.take(length));
        section_readers.push((offset, reader));
    }

    pool.scope(|scope| {
        for (offset, reader) in section_readers {
            let scanner = Arc::clone(scanner);
            let index = Arc::clone(index);
            let (tx, rx) = std::sync::mpsc::sync_channel(64);
            merger.start_merge_result_stream(rx, block_size_u64);

            scope.spawn(move |_| {
                let mut generator = ChecksumGenerator::new(block_size as usize);
                scanner.find_matching_blocks(reader, offset, &mut generator, &index, &tx);
            });
        }
    });

    Ok(())
}

fn open_index(locator: &str) -> Result<LoadedIndex> {
    let reader: Box<dyn Read> = if is_url(locator) {
        let response = reqwest::blocking::get(locator).map_err(|e| {
            BlockSyncError::RequestFailed(format!("error fetching index \"{}\": {}", locator, e))
        })?;
        if !response.status().is_success() {
            return Err(BlockSyncError::RequestFailed(format!(
                "request to {} returned status: {}",
                locator,
                response.status()
            )));
        }
        Box::new(response)
    } else {
        Box::new(File::open(locator)?)
    };

    indexfile::load_index(BufReader::new(reader))
}

pub fn is_url(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

fn sibling_temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "output".into());
    name.push(".blocksync-tmp");
    target.with_file_name(name)
}
