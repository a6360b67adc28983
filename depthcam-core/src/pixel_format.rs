use std::fmt::{self, Display};

use bitflags::bitflags;

/// 四字符代码 (Four Character Code)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FourCC(pub u32);

impl FourCC {
    /// 从 ASCII 字符创建 FourCC
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self((a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24))
    }

    /// 8-bit RGB (R-G-B 字节序)
    pub const RGB3: Self = Self::new(b'R', b'G', b'B', b'3');
    /// 8-bit 灰度，红外左/右目使用
    pub const GREY: Self = Self::new(b'G', b'R', b'E', b'Y');
    /// 16-bit 深度 (毫米，主机字节序)
    pub const Z16: Self = Self::new(b'Z', b'1', b'6', b' ');
    /// 点云：每像素一个 [f32; 3] (x, y, z 米)
    pub const XYZF: Self = Self::new(b'X', b'Y', b'Z', b'F');
}

impl Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

/// 相机可输出的数据类型
///
/// 一台深度相机同时输出多路数据，每一帧都带有自己的类型标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    Rgb,
    IrLeft,
    IrRight,
    Depth,
    PointCloud,
}

impl DataType {
    /// 固定的遍历顺序 (也是设备输出同一组帧的顺序)
    pub const ALL: [DataType; 5] = [
        DataType::Rgb,
        DataType::IrLeft,
        DataType::IrRight,
        DataType::Depth,
        DataType::PointCloud,
    ];

    pub fn pixel_format(self) -> FourCC {
        match self {
            DataType::Rgb => FourCC::RGB3,
            DataType::IrLeft | DataType::IrRight => FourCC::GREY,
            DataType::Depth => FourCC::Z16,
            DataType::PointCloud => FourCC::XYZF,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            DataType::Rgb => 3,
            DataType::IrLeft | DataType::IrRight => 1,
            DataType::Depth => 2,
            DataType::PointCloud => 12,
        }
    }

    /// 8-bit 强度图像 (可以做曝光融合)
    pub fn is_intensity(self) -> bool {
        matches!(self, DataType::Rgb | DataType::IrLeft | DataType::IrRight)
    }

    pub fn flag(self) -> DataTypes {
        match self {
            DataType::Rgb => DataTypes::RGB,
            DataType::IrLeft => DataTypes::IR_LEFT,
            DataType::IrRight => DataTypes::IR_RIGHT,
            DataType::Depth => DataTypes::DEPTH,
            DataType::PointCloud => DataTypes::POINT_CLOUD,
        }
    }

    /// 用于文件命名等机器可读场景的短名
    pub fn short_name(self) -> &'static str {
        match self {
            DataType::Rgb => "rgb",
            DataType::IrLeft => "ir_left",
            DataType::IrRight => "ir_right",
            DataType::Depth => "depth",
            DataType::PointCloud => "point_cloud",
        }
    }
}

bitflags! {
    /// 数据类型集合，一次采集可以同时请求多种类型
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serialize", serde(transparent))]
    pub struct DataTypes: u8 {
        const RGB = 1 << 0;
        const IR_LEFT = 1 << 1;
        const IR_RIGHT = 1 << 2;
        const DEPTH = 1 << 3;
        const POINT_CLOUD = 1 << 4;
    }
}

impl DataTypes {
    /// 按 `DataType::ALL` 的顺序遍历集合中的类型
    pub fn types(self) -> impl Iterator<Item = DataType> {
        DataType::ALL
            .into_iter()
            .filter(move |t| self.contains(t.flag()))
    }

    pub fn has(self, data_type: DataType) -> bool {
        self.contains(data_type.flag())
    }

    pub fn count(self) -> usize {
        self.bits().count_ones() as usize
    }
}

impl From<DataType> for DataTypes {
    fn from(t: DataType) -> Self {
        t.flag()
    }
}

impl FromIterator<DataType> for DataTypes {
    fn from_iter<I: IntoIterator<Item = DataType>>(iter: I) -> Self {
        iter.into_iter()
            .fold(DataTypes::empty(), |acc, t| acc | t.flag())
    }
}
