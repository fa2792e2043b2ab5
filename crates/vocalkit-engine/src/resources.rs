use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use vocalkit_observability::trace;

fn sha256_file(path: &Path) -> Result<String> {
    let mut f =
        fs::File::open(path).with_context(|| format!("open failed: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read failed: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Read-only directory of files shipped with the application.
#[derive(Debug, Clone)]
pub struct ResourceBundle {
    root: PathBuf,
    trace_dir: Option<PathBuf>,
}

impl ResourceBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            trace_dir: None,
        }
    }

    pub fn with_trace_dir(mut self, data_dir: &Path) -> Self {
        self.trace_dir = Some(data_dir.to_path_buf());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, name: &str) -> bool {
        self.root.join(name).is_file()
    }

    /// Copies `name` into `out_dir`, replacing a stale copy. An identical copy
    /// is left untouched.
    pub fn extract(&self, name: &str, out_dir: &Path) -> Result<PathBuf> {
        let src = self.root.join(name);
        if !src.is_file() {
            return Err(anyhow!(
                "E_RESOURCE_NOT_FOUND: {name} is not in the resource bundle at {}",
                self.root.display()
            ));
        }
        let dst = out_dir.join(name);
        if same_file(&src, &dst) {
            return Ok(dst);
        }

        let fresh = !dst.exists() || sha256_file(&src)? != sha256_file(&dst)?;
        if fresh {
            fs::create_dir_all(out_dir)
                .with_context(|| format!("create {} failed", out_dir.display()))?;
            let tmp = out_dir.join(format!("{name}.part"));
            fs::copy(&src, &tmp)
                .with_context(|| format!("copy {} failed", src.display()))?;
            fs::rename(&tmp, &dst)
                .with_context(|| format!("replace {} failed", dst.display()))?;
        }
        if let Some(dir) = &self.trace_dir {
            trace::event(
                dir,
                None,
                "Resources",
                "RES.extract",
                "ok",
                Some(serde_json::json!({ "name": name, "refreshed": fresh })),
            );
        }
        Ok(dst)
    }

    /// Like [`extract`](Self::extract) but a missing resource is `None`.
    pub fn extract_optional(&self, name: &str, out_dir: &Path) -> Result<Option<PathBuf>> {
        if !self.contains(name) {
            return Ok(None);
        }
        self.extract(name, out_dir).map(Some)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
