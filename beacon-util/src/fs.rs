use std::fs;
use std::io::{self, Write};
use std::path::Path;

use rand::distr::{Alphanumeric, SampleString};

/// Atomically creates a file with the given contents, overwriting
/// it if one exists.
///
/// The buffer is first written into a sibling temporary file which is
/// synced and then renamed over the destination. If this function returns
/// successfully the write reached the disk.
///
/// Read: [Ensuring data reaches to disk](https://lwn.net/Articles/457667/).
pub fn safe_write_all<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    let tmp_ext = "sync-".to_owned() + &Alphanumeric.sample_string(&mut rand::rng(), 6);
    let tmp_path = path.as_ref().with_extension(tmp_ext);
    let mut tmp_file = fs::File::create(&tmp_path)?;

    tmp_file.write_all(buf.as_ref())?;
    tmp_file.flush()?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    fs::rename(&tmp_path, path.as_ref())
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match path.as_ref().parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}
