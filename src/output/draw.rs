// 该文件是 Huoyan （火眼） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use ab_glyph::{FontArc, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};

use crate::model::Detection;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: i32 = 2;
const PALETTE_SIZE: usize = 80;

static FONT_DATA: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// 检测框与标签绘制
pub struct Draw {
  font: FontArc,
  scale: PxScale,
  /// 边界框颜色映射
  colors: Vec<Rgb<u8>>,
}

impl Draw {
  pub fn new() -> Result<Self, InvalidFont> {
    let font = FontArc::try_from_slice(FONT_DATA)?;

    // 每个类别一种颜色，在色相环上均匀分布
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb((i as f32 / PALETTE_SIZE as f32) * 360.0, 0.8, 0.9))
      .collect();

    Ok(Self {
      font,
      scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
    })
  }

  pub fn with_font_size(mut self, size: f32) -> Self {
    self.scale = PxScale::from(size.max(1.0));
    self
  }

  pub fn color_for(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  /// 标签背景尺寸（含内边距）
  pub fn label_size(&self, text: &str) -> (i32, i32) {
    let (w, h) = text_size(self.scale, &self.font, text);
    (
      w as i32 + 2 * LABEL_TEXT_PADDING,
      h as i32 + 2 * LABEL_TEXT_PADDING,
    )
  }

  /// 按检测顺序在帧上绘制边框与标签，后绘制的覆盖先绘制的
  pub fn annotate(&self, mut image: RgbImage, detections: &[Detection]) -> RgbImage {
    for detection in detections {
      self.draw_detection(&mut image, detection);
    }
    image
  }

  fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let [ax, ay, bx, by] = detection.bbox;
    let (x1, x2) = (ax.min(bx), ax.max(bx));
    let (y1, y2) = (ay.min(by), ay.max(by));

    // 完全在画面外
    if x2 < 0 || y2 < 0 || x1 >= w || y1 >= h {
      return;
    }

    let x1 = x1.clamp(0, w - 1);
    let y1 = y1.clamp(0, h - 1);
    let x2 = x2.clamp(0, w - 1);
    let y2 = y2.clamp(0, h - 1);
    if x1 >= x2 || y1 >= y2 {
      return;
    }

    let color = self.color_for(detection.class_id);

    // 绘制边框（加粗为2像素）
    for t in 0..BOX_THICKNESS {
      let (left, top, right, bottom) = (x1 + t, y1 + t, x2 - t, y2 - t);
      if left >= right || top >= bottom {
        break;
      }
      let rect = Rect::at(left, top).of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = format!("{} {:.2}", detection.label, detection.confidence);
    let (label_w, label_h) = self.label_size(&label);
    let (label_x, label_y) = label_origin(x1, y1, label_w, label_h, w);

    let bg_w = label_w.min(w - label_x);
    let bg_h = label_h.min(h - label_y);
    if bg_w <= 0 || bg_h <= 0 {
      return;
    }

    draw_filled_rect_mut(
      image,
      Rect::at(label_x, label_y).of_size(bg_w as u32, bg_h as u32),
      color,
    );
    draw_text_mut(
      image,
      LABEL_TEXT_COLOR,
      label_x + LABEL_TEXT_PADDING,
      label_y + LABEL_TEXT_PADDING,
      self.scale,
      &self.font,
      &label,
    );
  }
}

/// 标签位置：放在边框左上角上方，放不下时放在框内左上角。
/// 右侧超出画面时左移。
fn label_origin(x1: i32, y1: i32, label_w: i32, label_h: i32, frame_w: i32) -> (i32, i32) {
  let y = if y1 - label_h >= 0 { y1 - label_h } else { y1 };
  let x = x1.min(frame_w - label_w).max(0);
  (x, y)
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
