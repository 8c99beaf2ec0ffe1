use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::capture::Frame;
use crate::codec::Detection;

pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

pub const GESTURE_CLASSES: [&str; 8] = [
    "激活",
    "静音",
    "确定",
    "音量增大",
    "音量降低",
    "暂停",
    "上一个",
    "返回",
];

/// Backend output before thresholding and normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    /// Absolute pixel box (x1, y1, x2, y2).
    pub xyxy: [f32; 4],
}

/// A loaded detection model.
///
/// `infer` may fail; [`Detector`] turns a failure into an empty result.
pub trait DetectBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn infer(&self, frame: &Frame) -> anyhow::Result<Vec<RawDetection>>;
}

pub struct Detector {
    backend: Box<dyn DetectBackend>,
    class_list: Vec<String>,
    threshold: f32,
}

impl Detector {
    // pub
    pub fn new(
        backend: Box<dyn DetectBackend>,
        class_list: Vec<String>,
        threshold: f32,
    ) -> Self {
        Detector {
            backend,
            class_list,
            threshold,
        }
    }

    pub fn class_list(&self) -> &[String] {
        &self.class_list
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Runs the backend and returns the detections above threshold, in
    /// backend order. Never fails: backend errors become an empty list.
    pub fn detect(&self, frame: &Frame) -> Vec<Detection> {
        let raw = match self.backend.infer(frame) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("detector {} failed: {:#}", self.backend.name(), e);
                return Vec::new();
            }
        };

        let mut output = Vec::with_capacity(raw.len());
        for det in raw {
            // NaN fails both comparisons
            let usable =
                det.confidence >= self.threshold && det.xyxy.iter().all(|v| v.is_finite());
            if !usable {
                log::trace!("dropping candidate {:?}", det);
                continue;
            }
            let Some(class_label) = self.class_list.get(det.class_id) else {
                log::warn!(
                    "class index {} outside class table of {}",
                    det.class_id,
                    self.class_list.len()
                );
                continue;
            };
            let bbox = normalize_bbox(det.xyxy, frame.width, frame.height);
            if !bbox.iter().all(|v| v.is_finite()) {
                log::warn!("unusable box for {}x{} frame", frame.width, frame.height);
                continue;
            }
            output.push(Detection {
                class_label: class_label.clone(),
                confidence: round4(det.confidence as f64),
                bbox,
            });
        }
        output
    }
}

/// Converts an absolute (x1, y1, x2, y2) box to normalized
/// (center_x, center_y, width, height), each rounded to 4 decimals.
pub fn normalize_bbox(xyxy: [f32; 4], width: u32, height: u32) -> [f64; 4] {
    let [x1, y1, x2, y2] = xyxy.map(f64::from);
    let w = width as f64;
    let h = height as f64;
    [
        round4((x1 + x2) / 2.0 / w),
        round4((y1 + y2) / 2.0 / h),
        round4((x2 - x1) / w),
        round4((y2 - y1) / h),
    ]
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Reads one class name per line.
pub fn load_class_list<P: AsRef<Path>>(class_file: P) -> anyhow::Result<Vec<String>> {
    let file = File::open(class_file)?;
    let reader = BufReader::new(file);
    let mut class_list = Vec::new();
    for line in reader.lines() {
        let class = line?;
        let class = class.trim();
        if !class.is_empty() {
            class_list.push(class.to_string());
        }
    }
    Ok(class_list)
}

pub fn gesture_classes() -> Vec<String> {
    GESTURE_CLASSES.iter().map(|c| c.to_string()).collect()
}

#[cfg(feature = "opencv")]
pub use yolo::Yolo;

#[cfg(feature = "opencv")]
mod yolo {
    use std::sync::{Mutex, PoisonError};

    use anyhow::{anyhow, bail};
    use opencv::{self as cv, prelude::*};

    use super::{DetectBackend, RawDetection};
    use crate::capture::Frame;

    const INPUT_WIDTH: i32 = 640;
    const INPUT_HEIGHT: i32 = 640;
    const NMS_THRESHOLD: f32 = 0.4;

    /// YOLOv5-style ONNX model run through `opencv::dnn`.
    pub struct Yolo {
        net: Mutex<cv::dnn::Net>,
        class_count: usize,
        score_threshold: f32,
    }

    impl Yolo {
        // pub
        pub fn new(
            model_file: &str,
            class_count: usize,
            score_threshold: f32,
        ) -> anyhow::Result<Self> {
            let net = cv::dnn::read_net_from_onnx(model_file)?;
            Ok(Yolo {
                net: Mutex::new(net),
                class_count,
                score_threshold,
            })
        }

        // priv
        fn to_mat(frame: &Frame) -> anyhow::Result<cv::core::Mat> {
            let mut mat = cv::core::Mat::new_rows_cols_with_default(
                frame.height as i32,
                frame.width as i32,
                cv::core::CV_8UC3,
                cv::core::Scalar::all(0.),
            )?;
            let data = mat.data_bytes_mut()?;
            if data.len() != frame.pixels.len() {
                bail!(
                    "frame has {} bytes, expected {} for {}x{} BGR",
                    frame.pixels.len(),
                    data.len(),
                    frame.width,
                    frame.height
                );
            }
            data.copy_from_slice(&frame.pixels);
            Ok(mat)
        }

        /// Pads the image to a square with black on the right and bottom.
        fn image_format(image: &cv::core::Mat) -> anyhow::Result<cv::core::Mat> {
            let cols = image.cols();
            let rows = image.rows();
            let max = std::cmp::max(cols, rows);

            let mut padded = cv::core::Mat::default();
            cv::core::copy_make_border(
                image,
                &mut padded,
                0,
                max - rows,
                0,
                max - cols,
                cv::core::BORDER_CONSTANT,
                cv::core::Scalar::default(),
            )?;
            Ok(padded)
        }
    }

    impl DetectBackend for Yolo {
        fn name(&self) -> &'static str {
            "yolo"
        }

        fn infer(&self, frame: &Frame) -> anyhow::Result<Vec<RawDetection>> {
            // prehandle
            let image = Self::to_mat(frame)?;
            let input_image = Self::image_format(&image)?;
            let mut blob = cv::dnn::blob_from_image(
                &input_image,
                1. / 255.,
                cv::core::Size::new(INPUT_WIDTH, INPUT_HEIGHT),
                cv::core::Scalar::default(),
                true,
                false,
                cv::core::CV_32F,
            )?;

            let mut forward_output = cv::types::VectorOfMat::new();
            {
                let mut net = self.net.lock().unwrap_or_else(PoisonError::into_inner);
                net.set_input(&mut blob, "", 1.0, cv::core::Scalar::default())?;
                let out_blob_names = net.get_unconnected_out_layers_names()?;
                net.forward(&mut forward_output, &out_blob_names)?;
            }

            // handle forward result
            let group_length = self.class_count + 5;
            let x_factor = input_image.cols() as f32 / INPUT_WIDTH as f32;
            let y_factor = input_image.rows() as f32 / INPUT_HEIGHT as f32;

            let mut binding = forward_output.get(0)?;
            let forward_data = binding.data_typed_mut::<f32>()?;
            if forward_data.len() % group_length != 0 {
                return Err(anyhow!(
                    "model output of {} values does not match {} classes",
                    forward_data.len(),
                    self.class_count
                ));
            }

            let mut class_ids = Vec::<usize>::new();
            let mut confidences = cv::core::Vector::<f32>::new();
            let mut positions = cv::core::Vector::<cv::core::Rect>::new();

            for row in forward_data.chunks_exact(group_length) {
                let confidence = row[4];
                if confidence < self.score_threshold {
                    continue;
                }

                let mut class_id: usize = 0;
                let mut max_class_score: f32 = 0.0;
                for (j, &score) in row[5..].iter().enumerate() {
                    if score > max_class_score {
                        class_id = j;
                        max_class_score = score;
                    }
                }

                let (x, y, w, h) = (row[0], row[1], row[2], row[3]);
                let left = ((x - 0.5 * w) * x_factor) as i32;
                let top = ((y - 0.5 * h) * y_factor) as i32;
                let width = (w * x_factor) as i32;
                let height = (h * y_factor) as i32;

                confidences.push(confidence);
                class_ids.push(class_id);
                positions.push(cv::core::Rect::new(left, top, width, height));
            }

            // handle possibly repeat
            let mut nms_result = cv::core::Vector::<i32>::new();
            cv::dnn::nms_boxes(
                &positions,
                &confidences,
                self.score_threshold,
                NMS_THRESHOLD,
                &mut nms_result,
                1.,
                0,
            )?;

            let mut output = Vec::with_capacity(nms_result.len());
            for idx in nms_result.iter() {
                let idx = idx as usize;
                let rect = positions.get(idx)?;
                output.push(RawDetection {
                    class_id: class_ids[idx],
                    confidence: confidences.get(idx)?,
                    xyxy: [
                        rect.x as f32,
                        rect.y as f32,
                        (rect.x + rect.width) as f32,
                        (rect.y + rect.height) as f32,
                    ],
                });
            }
            Ok(output)
        }
    }
}
