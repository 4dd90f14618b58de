//! 进程内 workspace 工具提供方
//!
//! SafeFs 绑定目标目录，所有路径经 resolve 校验必须在根目录下（禁止 ../ 与符号链接逃逸）；
//! 提供 list_directory / read_file / search_files / directory_tree 四个只读工具。

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::tools::provider::{ToolInfo, ToolProvider};

/// 遍历时跳过的目录
const SKIP_DIRS: &[&str] = &["target", "node_modules", "__pycache__"];
/// 单个文件超过此大小不参与搜索
const MAX_SEARCH_FILE_SIZE: u64 = 1024 * 1024;
/// 单个文件最多展示的匹配行
const MAX_MATCHES_PER_FILE: usize = 10;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 解析路径（相对根目录或根目录下的绝对路径），拒绝根目录之外的路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let trimmed = path.trim();
        let full = if trimmed.is_empty() || trimmed == "." {
            self.root_dir.clone()
        } else if Path::new(trimmed).is_absolute() {
            PathBuf::from(trimmed)
        } else {
            self.root_dir.join(trimmed.trim_start_matches("./"))
        };
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Access denied: '{}' is outside the target directory", path))
        }
    }

    fn relative<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, str> {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
    }

    pub fn read_file(&self, path: &str, max_bytes: usize) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            return Err(format!("'{}' is a directory", path));
        }
        let file = std::fs::File::open(&resolved).map_err(|e| format!("Read failed: {}", e))?;
        let total = file
            .metadata()
            .map_err(|e| format!("Read failed: {}", e))?
            .len();
        // 只读取 max_bytes + 1 字节，大文件不整体载入
        let mut bytes = Vec::with_capacity(max_bytes.min(total as usize) + 1);
        file.take(max_bytes as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| format!("Read failed: {}", e))?;
        let truncated = bytes.len() > max_bytes;
        bytes.truncate(max_bytes);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if truncated {
            Ok(format!(
                "{}\n... [truncated: showing {} of {} bytes]",
                text,
                max_bytes,
                total.max(max_bytes as u64 + 1)
            ))
        } else {
            Ok(text)
        }
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = self.resolve(path)?;
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| format!("List failed: {}", e))? {
            let e = e.map_err(|e| e.to_string())?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// 目录树（缩进两格一层），depth 为最大深度
    pub fn tree(&self, path: &str, depth: usize) -> Result<String, String> {
        let base = self.resolve(path)?;
        let mut lines = Vec::new();
        for entry in walkdir::WalkDir::new(&base)
            .min_depth(1)
            .max_depth(depth.max(1))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e))
            .filter_map(|e| e.ok())
        {
            let indent = "  ".repeat(entry.depth() - 1);
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            lines.push(format!(
                "{}{}{}",
                indent,
                entry.file_name().to_string_lossy(),
                suffix
            ));
        }
        Ok(lines.join("\n"))
    }

    /// 递归搜索文件内容；include 为文件名 glob（如 *.rs）
    pub fn search(
        &self,
        path: &str,
        pattern: &str,
        include: Option<&str>,
        use_regex: bool,
        max_results: usize,
    ) -> Result<String, String> {
        let base = self.resolve(path)?;
        let matcher = if use_regex {
            Some(regex::Regex::new(pattern).map_err(|e| format!("Invalid regex pattern: {}", e))?)
        } else {
            None
        };
        let include = include
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| format!("Invalid include pattern: {}", e))?;

        let mut output = Vec::new();
        let mut total = 0usize;
        for entry in walkdir::WalkDir::new(&base)
            .max_depth(10)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e))
            .filter_map(|e| e.ok())
        {
            if total >= max_results {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_SEARCH_FILE_SIZE).unwrap_or(true) {
                continue;
            }
            if let Some(ref glob) = include {
                let name = entry.file_name().to_string_lossy();
                if !glob.matches(&name) {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let matches: Vec<(usize, &str)> = content
                .lines()
                .enumerate()
                .filter(|(_, line)| match &matcher {
                    Some(re) => re.is_match(line),
                    None => line.contains(pattern),
                })
                .map(|(i, line)| (i + 1, line))
                .collect();
            if matches.is_empty() {
                continue;
            }
            total += matches.len();
            output.push(format!("{}:", self.relative(entry.path())));
            for (line_num, line) in matches.iter().take(MAX_MATCHES_PER_FILE) {
                let shown: String = line.chars().take(120).collect();
                output.push(format!("  {:4}: {}", line_num, shown.trim_end()));
            }
            if matches.len() > MAX_MATCHES_PER_FILE {
                output.push(format!(
                    "  ... ({} more matches)",
                    matches.len() - MAX_MATCHES_PER_FILE
                ));
            }
        }

        if output.is_empty() {
            Ok(format!("No matches found for pattern '{}'", pattern))
        } else {
            Ok(format!(
                "Found {} matches for pattern '{}'\n{}",
                total,
                pattern,
                output.join("\n")
            ))
        }
    }
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

/// workspace 提供方：进程内，只读
pub struct WorkspaceProvider {
    fs: SafeFs,
    max_read_bytes: usize,
    max_search_results: usize,
}

impl WorkspaceProvider {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
            max_read_bytes: 256 * 1024,
            max_search_results: 50,
        }
    }

    pub fn with_limits(mut self, max_read_bytes: usize, max_search_results: usize) -> Self {
        self.max_read_bytes = max_read_bytes;
        self.max_search_results = max_search_results;
        self
    }

    fn tool_infos() -> Vec<ToolInfo> {
        vec![
            ToolInfo::new(
                "list_directory",
                "List entries of a directory inside the target (directories end with '/').",
            )
            .with_schema(json!({
                "type": "object",
                "properties": { "path": { "type": "string", "description": "relative path, default '.'" } }
            })),
            ToolInfo::new("read_file", "Read a text file inside the target directory.").with_schema(json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })),
            ToolInfo::new(
                "search_files",
                "Search file contents under a path; optional filename glob and regex mode.",
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "include": { "type": "string", "description": "filename glob such as *.rs" },
                    "use_regex": { "type": "boolean" }
                },
                "required": ["pattern"]
            })),
            ToolInfo::new("directory_tree", "Show the directory tree under a path.").with_schema(json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "max_depth": { "type": "integer", "minimum": 1 }
                }
            })),
        ]
    }
}

#[async_trait]
impl ToolProvider for WorkspaceProvider {
    fn name(&self) -> &str {
        "workspace"
    }

    async fn list(&self) -> Result<Vec<ToolInfo>, AgentError> {
        Ok(Self::tool_infos())
    }

    async fn invoke(&self, tool: &str, args: Value) -> Result<String, String> {
        let fs = self.fs.clone();
        let tool = tool.to_string();
        let max_read = self.max_read_bytes;
        let max_results = self.max_search_results;
        tracing::debug!(tool = %tool, "workspace tool invoke");
        tokio::task::spawn_blocking(move || match tool.as_str() {
            "list_directory" => fs
                .list_dir(str_arg(&args, "path").unwrap_or("."))
                .map(|entries| entries.join("\n")),
            "read_file" => {
                let path = str_arg(&args, "path").ok_or("Missing required parameter: path")?;
                fs.read_file(path, max_read)
            }
            "search_files" => {
                let pattern =
                    str_arg(&args, "pattern").ok_or("Missing required parameter: pattern")?;
                fs.search(
                    str_arg(&args, "path").unwrap_or("."),
                    pattern,
                    str_arg(&args, "include"),
                    args.get("use_regex").and_then(|v| v.as_bool()).unwrap_or(false),
                    max_results,
                )
            }
            "directory_tree" => {
                let depth = args
                    .get("max_depth")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(3) as usize;
                fs.tree(str_arg(&args, "path").unwrap_or("."), depth)
            }
            other => Err(format!("workspace provider has no tool '{}'", other)),
        })
        .await
        .map_err(|e| format!("workspace task failed: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/auth")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(
            dir.path().join("src/auth/login.rs"),
            "pub fn login(user: &str) -> bool {\n    verify_token(user)\n}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(dir.path().join("target/junk.rs"), "verify_token\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_list_and_read() {
        let repo = sample_repo();
        let p = WorkspaceProvider::new(repo.path());
        let listing = p.invoke("list_directory", json!({})).await.unwrap();
        assert_eq!(listing, "README.md\nsrc/\ntarget/");
        let content = p.invoke("read_file", json!({"path": "src/main.rs"})).await.unwrap();
        assert_eq!(content, "fn main() {}\n");
    }

    #[tokio::test]
    async fn test_rejects_escape() {
        let repo = sample_repo();
        let p = WorkspaceProvider::new(repo.path().join("src"));
        let err = p
            .invoke("read_file", json!({"path": "../README.md"}))
            .await
            .unwrap_err();
        assert!(err.contains("outside the target"));
        let err = p.invoke("list_directory", json!({"path": "/"})).await.unwrap_err();
        assert!(err.contains("outside the target"));
    }

    #[tokio::test]
    async fn test_search_skips_build_dirs() {
        let repo = sample_repo();
        let p = WorkspaceProvider::new(repo.path());
        let out = p
            .invoke("search_files", json!({"pattern": "verify_token", "include": "*.rs"}))
            .await
            .unwrap();
        assert!(out.starts_with("Found 1 matches"));
        assert!(out.contains("src/auth/login.rs"));
        assert!(!out.contains("target/junk.rs"));
    }

    #[tokio::test]
    async fn test_search_invalid_regex() {
        let repo = sample_repo();
        let p = WorkspaceProvider::new(repo.path());
        let err = p
            .invoke("search_files", json!({"pattern": "(", "use_regex": true}))
            .await
            .unwrap_err();
        assert!(err.contains("Invalid regex"));
    }

    #[tokio::test]
    async fn test_read_truncates() {
        let repo = sample_repo();
        let p = WorkspaceProvider::new(repo.path()).with_limits(4, 10);
        let out = p.invoke("read_file", json!({"path": "README.md"})).await.unwrap();
        assert!(out.starts_with("# de"));
        assert!(out.contains("truncated"));
    }

    #[test]
    fn test_read_large_file_reads_only_limit() {
        let repo = sample_repo();
        let big = "x".repeat(3 * 1024 * 1024);
        std::fs::write(repo.path().join("big.log"), &big).unwrap();
        let fs = SafeFs::new(repo.path());
        let out = fs.read_file("big.log", 16).unwrap();
        assert!(out.starts_with(&"x".repeat(16)));
        assert!(!out.starts_with(&"x".repeat(17)));
        assert!(out.ends_with(&format!("[truncated: showing 16 of {} bytes]", big.len())));

        // 恰好等于上限时不截断
        std::fs::write(repo.path().join("exact.txt"), "0123456789").unwrap();
        assert_eq!(fs.read_file("exact.txt", 10).unwrap(), "0123456789");
    }

    #[tokio::test]
    async fn test_tree_and_unknown_tool() {
        let repo = sample_repo();
        let p = WorkspaceProvider::new(repo.path());
        let tree = p.invoke("directory_tree", json!({"max_depth": 2})).await.unwrap();
        assert!(tree.contains("src/"));
        assert!(tree.contains("  auth/"));
        assert!(!tree.contains("target"));
        assert!(p.invoke("rm_rf", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_stable() {
        let repo = sample_repo();
        let p = WorkspaceProvider::new(repo.path());
        let a: Vec<_> = p.list().await.unwrap().into_iter().map(|t| t.name).collect();
        let b: Vec<_> = p.list().await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
    }
}
