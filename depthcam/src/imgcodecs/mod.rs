//! 采集结果的保存
//!
//! 每个作业一个目录，文件名由采集工具给出的标签决定。
//! RGB 存 8-bit RGB PNG，IR 存 8-bit 灰度 PNG，深度存 16-bit 灰度 PNG，点云存 ASCII PLY；
//! `SaveFormat::Raw` 直接写出负载。

use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use thiserror::Error;

use depthcam_core::capture::{JobId, SaveFormat};
use depthcam_core::frame::Frame;
use depthcam_core::pixel_format::DataType;

/// 保存位置：作业 + 作业内的文件标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub job: JobId,
    pub label: String,
}

impl SaveTarget {
    pub fn new(job: JobId, label: impl Into<String>) -> Self {
        Self {
            job,
            label: label.into(),
        }
    }
}

/// 保存策略
///
/// 在阻塞线程池中调用，实现可以直接做同步 IO。
pub trait SaveStrategy: Send + Sync {
    fn save(&self, target: &SaveTarget, frame: &Frame, format: SaveFormat) -> io::Result<PathBuf>;

    /// 作业失败时丢弃已保存的文件
    fn discard(&self, paths: &[PathBuf]) {
        remove_files(paths);
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(target: "depthcam::capture", "Failed to discard {}: {}", path.display(), e);
        }
    }
}

#[derive(Error, Debug)]
enum EncodeError {
    #[error("{data_type:?} payload of {len} bytes does not match {width}x{height}")]
    Malformed {
        data_type: DataType,
        width: u32,
        height: u32,
        len: usize,
    },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<EncodeError> for io::Error {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// 文件扩展名
pub fn extension(data_type: DataType, format: SaveFormat) -> &'static str {
    match (format, data_type) {
        (SaveFormat::Raw, _) => "raw",
        (SaveFormat::Png, DataType::PointCloud) => "ply",
        (SaveFormat::Png, _) => "png",
    }
}

/// 写入本地文件系统
#[derive(Debug, Clone)]
pub struct FileSaveStrategy {
    root: PathBuf,
}

impl FileSaveStrategy {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job: JobId) -> PathBuf {
        self.root.join(job.to_string())
    }
}

impl SaveStrategy for FileSaveStrategy {
    fn save(&self, target: &SaveTarget, frame: &Frame, format: SaveFormat) -> io::Result<PathBuf> {
        let dir = self.job_dir(target.job);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{}.{}",
            target.label,
            extension(frame.data_type, format)
        ));

        match format {
            SaveFormat::Raw => fs::write(&path, &frame.data)?,
            SaveFormat::Png => encode(&path, frame)?,
        }
        tracing::debug!(target: "depthcam::capture", "Saved {}", path.display());
        Ok(path)
    }

    fn discard(&self, paths: &[PathBuf]) {
        remove_files(paths);
        // 目录空了就一并删除 (非空时 remove_dir 失败，忽略)
        let mut dirs: Vec<&Path> = paths.iter().filter_map(|p| p.parent()).collect();
        dirs.dedup();
        for dir in dirs {
            let _ = fs::remove_dir(dir);
        }
    }
}

fn encode(path: &Path, frame: &Frame) -> Result<(), EncodeError> {
    let malformed = || EncodeError::Malformed {
        data_type: frame.data_type,
        width: frame.width,
        height: frame.height,
        len: frame.data.len(),
    };
    if !frame.is_well_formed() {
        return Err(malformed());
    }

    match frame.data_type {
        DataType::Rgb => {
            let img = RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec())
                .ok_or_else(malformed)?;
            img.save(path)?;
        }
        DataType::IrLeft | DataType::IrRight => {
            let img = GrayImage::from_raw(frame.width, frame.height, frame.data.to_vec())
                .ok_or_else(malformed)?;
            img.save(path)?;
        }
        DataType::Depth => {
            let values = frame.depth_values().ok_or_else(malformed)?.into_owned();
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_raw(frame.width, frame.height, values).ok_or_else(malformed)?;
            img.save(path)?;
        }
        DataType::PointCloud => {
            let points = frame.points().ok_or_else(malformed)?;
            write_ply(path, &points)?;
        }
    }
    Ok(())
}

/// ASCII PLY，无效点 (z <= 0) 不写出
fn write_ply(path: &Path, points: &[[f32; 3]]) -> io::Result<()> {
    let valid: Vec<&[f32; 3]> = points.iter().filter(|p| p[2] > 0.0).collect();
    let mut out = BufWriter::new(fs::File::create(path)?);
    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", valid.len())?;
    writeln!(out, "property float x")?;
    writeln!(out, "property float y")?;
    writeln!(out, "property float z")?;
    writeln!(out, "end_header")?;
    for [x, y, z] in valid {
        writeln!(out, "{} {} {}", x, y, z)?;
    }
    out.flush()
}

/// 一次内存保存的记录
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFrame {
    pub path: PathBuf,
    pub data_type: DataType,
    pub sequence: u64,
    pub format: SaveFormat,
    pub data: Bytes,
}

/// 把保存结果留在内存里，供无界面调用方和测试使用
#[derive(Default)]
pub struct MemorySaveStrategy {
    saved: Mutex<Vec<SavedFrame>>,
    // 剩余多少次保存后开始失败
    fail_after: Mutex<Option<usize>>,
}

impl fmt::Debug for MemorySaveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySaveStrategy")
            .field("saved", &self.saved().len())
            .finish()
    }
}

impl MemorySaveStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// 成功保存 `count` 次之后，后续保存全部失败
    pub fn fail_after(&self, count: usize) {
        *self.fail_after.lock().unwrap_or_else(|p| p.into_inner()) = Some(count);
    }

    pub fn saved(&self) -> Vec<SavedFrame> {
        self.saved.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl SaveStrategy for MemorySaveStrategy {
    fn save(&self, target: &SaveTarget, frame: &Frame, format: SaveFormat) -> io::Result<PathBuf> {
        {
            let mut fail_after = self.fail_after.lock().unwrap_or_else(|p| p.into_inner());
            match fail_after.as_mut() {
                Some(0) => {
                    return Err(io::Error::new(io::ErrorKind::Other, "storage full"));
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }
        let path = PathBuf::from(target.job.to_string()).join(format!(
            "{}.{}",
            target.label,
            extension(frame.data_type, format)
        ));
        self.saved
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(SavedFrame {
                path: path.clone(),
                data_type: frame.data_type,
                sequence: frame.sequence,
                format,
                data: frame.data.clone(),
            });
        Ok(path)
    }

    fn discard(&self, paths: &[PathBuf]) {
        self.saved
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|s| !paths.contains(&s.path));
    }
}
