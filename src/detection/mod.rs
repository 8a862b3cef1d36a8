/// 检测系统 (Detection System)
///
/// - types:   检测框与检测结果
/// - decoder: 模型输出解码 (阈值过滤 + 按类 NMS + 坐标还原)
pub mod decoder;
pub mod types;

pub use decoder::DetectionDecoder;
pub use types::{Bbox, Detection};
