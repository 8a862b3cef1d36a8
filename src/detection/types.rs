// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测框数据结构 (Detection data types)

use serde::Serialize;

use crate::types::StreamId;

/// 轴对齐检测框 (左上角 + 宽高)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Bbox {
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
        }
    }

    /// 由中心点 + 宽高构造 (YOLO 输出格式)
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2., cy - h / 2., w, h)
    }

    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn xyxy(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax(), self.ymax()]
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.) * self.height.max(0.)
    }

    /// 除以缩放比例, 还原到源分辨率
    pub fn unscale(&self, ratio: f32) -> Self {
        Self::new(
            self.xmin / ratio,
            self.ymin / ratio,
            self.width / ratio,
            self.height / ratio,
        )
    }

    /// 裁剪到 [0, w] x [0, h]
    pub fn clamp(&self, w: f32, h: f32) -> Self {
        let x1 = self.xmin.clamp(0., w);
        let y1 = self.ymin.clamp(0., h);
        let x2 = self.xmax().clamp(0., w);
        let y2 = self.ymax().clamp(0., h);
        Self::from_xyxy(x1, y1, x2, y2)
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// 连续坐标 IoU; 并集为 0 时返回 0
    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

/// 单个检测结果 (不可变)
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub score: f32,
    /// 源分辨率像素坐标
    pub bbox: Bbox,
    /// 归一化坐标 [x_min, y_min, x_max, y_max], 范围 [0, 1]
    pub normalized: [f32; 4],
    pub stream: StreamId,
    pub frame_seq: u64,
}
