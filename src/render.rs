//! Rendered output.
//!
//! Boxes, a status banner and per-class count pips are burned into the
//! original (not upscaled) frames and streamed to a `FrameWriter`. Rendering
//! never feeds back into counting or classification.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::aggregate::{ClassMap, FrameTally, RunningAggregate};
use crate::classify::{safety_status, SafetyStatus};
use crate::detect::Detection;
use crate::frame::Frame;
use crate::sampler::FrameObserver;

const PERSON_COLOR: [u8; 3] = [0, 200, 0];
const CAR_COLOR: [u8; 3] = [30, 90, 255];
const FIRE_COLOR: [u8; 3] = [230, 20, 20];
const OTHER_COLOR: [u8; 3] = [200, 200, 200];
const SAFE_COLOR: [u8; 3] = [0, 160, 0];
const UNSAFE_COLOR: [u8; 3] = [200, 0, 0];

const PIP_SIZE: u32 = 3;
const PIP_GAP: u32 = 1;
const MAX_PIPS: u64 = 60;

/// Extensions routed to the video encoder rather than a PNG directory.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi"];

/// Default output frame rate when the source does not announce one.
pub const DEFAULT_OUTPUT_FPS: i32 = 25;

fn class_color(class_id: u32, classes: &ClassMap) -> [u8; 3] {
    if class_id == classes.person {
        PERSON_COLOR
    } else if class_id == classes.car {
        CAR_COLOR
    } else if class_id == classes.fire {
        FIRE_COLOR
    } else {
        OTHER_COLOR
    }
}

fn banner_height(image: &RgbImage) -> u32 {
    (image.height() / 12).max(PIP_SIZE * 3 + PIP_GAP * 4).min(image.height())
}

/// Draw one frame's overlay in place.
pub fn draw_overlay(
    image: &mut RgbImage,
    detections: &[Detection],
    classes: &ClassMap,
    tally: &FrameTally,
    status: SafetyStatus,
) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }

    for det in detections {
        let b = det.bbox.clamp_to(w, h);
        let bw = b.width().round() as u32;
        let bh = b.height().round() as u32;
        if bw == 0 || bh == 0 {
            continue;
        }
        let rect = Rect::at(b.x1 as i32, b.y1 as i32).of_size(bw, bh);
        draw_hollow_rect_mut(image, rect, Rgb(class_color(det.class_id, classes)));
    }

    let banner = match status {
        SafetyStatus::Safe => SAFE_COLOR,
        SafetyStatus::Unsafe => UNSAFE_COLOR,
    };
    draw_filled_rect_mut(
        image,
        Rect::at(0, 0).of_size(w, banner_height(image)),
        Rgb(banner),
    );

    let rows = [
        (tally.persons, PERSON_COLOR),
        (tally.cars, CAR_COLOR),
        (tally.fires, FIRE_COLOR),
    ];
    for (row, (count, color)) in rows.into_iter().enumerate() {
        let y = PIP_GAP + row as u32 * (PIP_SIZE + PIP_GAP);
        for i in 0..count.min(MAX_PIPS) as u32 {
            let x = PIP_GAP + i * (PIP_SIZE + PIP_GAP);
            if x + PIP_SIZE > w || y + PIP_SIZE > h {
                break;
            }
            draw_filled_rect_mut(
                image,
                Rect::at(x as i32, y as i32).of_size(PIP_SIZE, PIP_SIZE),
                Rgb(color),
            );
        }
    }
}

/// Sink for rendered frames.
pub trait FrameWriter {
    fn write(&mut self, image: &RgbImage) -> Result<()>;

    /// Flush and close the output, returning where it was written.
    fn finish(self: Box<Self>) -> Result<PathBuf>;
}

/// Writes `frame_000001.png`, `frame_000002.png`, ... into a directory.
pub struct PngSequenceWriter {
    dir: PathBuf,
    written: u64,
}

impl PngSequenceWriter {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }
}

impl FrameWriter for PngSequenceWriter {
    fn write(&mut self, image: &RgbImage) -> Result<()> {
        self.written += 1;
        let path = self.dir.join(format!("frame_{:06}.png", self.written));
        image
            .save(&path)
            .with_context(|| format!("write {}", path.display()))
    }

    fn finish(self: Box<Self>) -> Result<PathBuf> {
        log::info!(
            "wrote {} rendered frames to {}",
            self.written,
            self.dir.display()
        );
        Ok(self.dir)
    }
}

fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Pick a writer for `path`: video container extensions encode H.264,
/// anything else is a PNG-sequence directory.
pub fn open_writer(path: &Path) -> Result<Box<dyn FrameWriter>> {
    if is_video_path(path) {
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            return Ok(Box::new(ffmpeg_writer::FfmpegVideoWriter::create(
                path,
                DEFAULT_OUTPUT_FPS,
            )?));
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            return Err(anyhow!(
                "writing {} requires the ingest-file-ffmpeg feature; use a directory path for PNG frames",
                path.display()
            ));
        }
    }
    if path.is_file() {
        return Err(anyhow!(
            "output path {} is an existing file, expected a directory",
            path.display()
        ));
    }
    Ok(Box::new(PngSequenceWriter::create(path)?))
}

/// Renders every decoded frame.
///
/// Sampled frames get fresh boxes; skipped frames repeat the last sampled
/// frame's overlay so the output keeps the input's frame count.
pub struct OverlayRenderer {
    writer: Box<dyn FrameWriter>,
    classes: ClassMap,
    unsafe_threshold: u64,
    last: Option<(Vec<Detection>, FrameTally, SafetyStatus)>,
}

impl OverlayRenderer {
    pub fn new(writer: Box<dyn FrameWriter>, classes: ClassMap, unsafe_threshold: u64) -> Self {
        Self {
            writer,
            classes,
            unsafe_threshold,
            last: None,
        }
    }

    pub fn finish(self) -> Result<PathBuf> {
        self.writer.finish()
    }

    fn render(&mut self, frame: &Frame) -> Result<()> {
        let mut image = frame.to_image()?;
        if let Some((detections, tally, status)) = &self.last {
            draw_overlay(&mut image, detections, &self.classes, tally, *status);
        }
        self.writer.write(&image)
    }
}

impl FrameObserver for OverlayRenderer {
    fn on_sampled(
        &mut self,
        frame: &Frame,
        detections: &[Detection],
        aggregate: &RunningAggregate,
    ) -> Result<()> {
        let tally = FrameTally::from_detections(detections, &self.classes);
        let status = safety_status(aggregate.max_persons_per_frame(), self.unsafe_threshold);
        self.last = Some((detections.to_vec(), tally, status));
        self.render(frame)
    }

    fn on_skipped(&mut self, frame: &Frame) -> Result<()> {
        self.render(frame)
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
mod ffmpeg_writer {
    use std::path::{Path, PathBuf};

    use anyhow::{anyhow, Context, Result};
    use ffmpeg_next as ffmpeg;
    use ffmpeg_next::{codec, encoder, format, frame, software::scaling, util::rational::Rational};
    use image::RgbImage;

    use super::FrameWriter;

    const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;

    struct EncoderState {
        encoder: encoder::Video,
        to_yuv: scaling::Context,
        rgb: frame::Video,
        yuv: frame::Video,
        stream_index: usize,
        width: u32,
        height: u32,
    }

    /// H.264 writer. The encoder is opened lazily on the first frame, once
    /// the output size is known. Dropping an unfinished writer still writes
    /// the trailer so the file stays playable.
    pub struct FfmpegVideoWriter {
        path: PathBuf,
        octx: format::context::Output,
        time_base: Rational,
        frame_rate: Rational,
        state: Option<EncoderState>,
        next_pts: i64,
        finished: bool,
    }

    impl FfmpegVideoWriter {
        pub fn create(path: &Path, fps: i32) -> Result<Self> {
            ffmpeg::init().context("initialize ffmpeg")?;
            let octx = format::output(&path)
                .with_context(|| format!("create output video {}", path.display()))?;
            Ok(Self {
                path: path.to_path_buf(),
                octx,
                time_base: Rational::new(1, fps),
                frame_rate: Rational::new(fps, 1),
                state: None,
                next_pts: 0,
                finished: false,
            })
        }

        fn open_encoder(&mut self, width: u32, height: u32) -> Result<()> {
            let codec = encoder::find(codec::Id::H264)
                .context("H.264 encoder not found; is FFmpeg built with libx264?")?;
            let global_header = self
                .octx
                .format()
                .flags()
                .contains(format::flag::Flags::GLOBAL_HEADER);
            let mut stream = self.octx.add_stream(codec)?;
            let mut builder = codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()?;
            builder.set_width(width);
            builder.set_height(height);
            builder.set_format(ENCODE_FORMAT);
            builder.set_time_base(self.time_base);
            builder.set_frame_rate(Some(self.frame_rate));
            if global_header {
                builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
            }
            let encoder = builder
                .open_as_with(
                    codec,
                    ffmpeg::Dictionary::from_iter([("crf", "23"), ("preset", "fast")]),
                )
                .context("open H.264 encoder")?;
            stream.set_parameters(&encoder);
            let stream_index = stream.index();

            let to_yuv = scaling::Context::get(
                format::Pixel::RGB24,
                width,
                height,
                ENCODE_FORMAT,
                width,
                height,
                scaling::Flags::BILINEAR,
            )
            .context("create RGB to YUV scaler")?;

            self.octx
                .write_header()
                .context("write output video header")?;
            log::info!(
                "encoding {}x{} H.264 to {}",
                width,
                height,
                self.path.display()
            );

            self.state = Some(EncoderState {
                encoder,
                to_yuv,
                rgb: frame::Video::new(format::Pixel::RGB24, width, height),
                yuv: frame::Video::empty(),
                stream_index,
                width,
                height,
            });
            Ok(())
        }

        fn finalize(&mut self) -> Result<()> {
            if self.finished {
                return Ok(());
            }
            self.finished = true;
            let state = self
                .state
                .as_mut()
                .ok_or_else(|| anyhow!("no frames were rendered to {}", self.path.display()))?;
            state.encoder.send_eof().context("flush H.264 encoder")?;
            drain_packets(
                &mut state.encoder,
                &mut self.octx,
                state.stream_index,
                self.time_base,
            )?;
            self.octx
                .write_trailer()
                .context("write output video trailer")?;
            Ok(())
        }
    }

    impl FrameWriter for FfmpegVideoWriter {
        fn write(&mut self, image: &RgbImage) -> Result<()> {
            if self.state.is_none() {
                self.open_encoder(image.width(), image.height())?;
            }
            let state = self
                .state
                .as_mut()
                .ok_or_else(|| anyhow!("encoder not initialised"))?;
            if image.dimensions() != (state.width, state.height) {
                return Err(anyhow!(
                    "frame size changed from {}x{} to {}x{}",
                    state.width,
                    state.height,
                    image.width(),
                    image.height()
                ));
            }

            let row_bytes = state.width as usize * 3;
            let stride = state.rgb.stride(0);
            let src = image.as_raw();
            let plane = state.rgb.data_mut(0);
            for row in 0..state.height as usize {
                let dst = row * stride;
                let from = row * row_bytes;
                plane[dst..dst + row_bytes].copy_from_slice(&src[from..from + row_bytes]);
            }

            state
                .to_yuv
                .run(&state.rgb, &mut state.yuv)
                .context("convert frame to YUV")?;
            state.yuv.set_pts(Some(self.next_pts));
            self.next_pts += 1;
            state
                .encoder
                .send_frame(&state.yuv)
                .context("send frame to H.264 encoder")?;
            drain_packets(
                &mut state.encoder,
                &mut self.octx,
                state.stream_index,
                self.time_base,
            )
        }

        fn finish(mut self: Box<Self>) -> Result<PathBuf> {
            self.finalize()?;
            log::info!(
                "wrote {} rendered frames to {}",
                self.next_pts,
                self.path.display()
            );
            Ok(self.path.clone())
        }
    }

    impl Drop for FfmpegVideoWriter {
        fn drop(&mut self) {
            if !self.finished && self.state.is_some() {
                if let Err(err) = self.finalize() {
                    log::warn!("failed to finalize {}: {:#}", self.path.display(), err);
                }
            }
        }
    }

    fn drain_packets(
        encoder: &mut encoder::Video,
        octx: &mut format::context::Output,
        stream_index: usize,
        time_base: Rational,
    ) -> Result<()> {
        let stream_time_base = octx
            .stream(stream_index)
            .map(|stream| stream.time_base())
            .unwrap_or(time_base);
        let mut encoded = ffmpeg::Packet::empty();
        while encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(stream_index);
            encoded.rescale_ts(time_base, stream_time_base);
            encoded
                .write_interleaved(octx)
                .context("write encoded packet")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, StubBackend};
    use crate::ingest::synthetic::{SyntheticConfig, SyntheticSource};
    use crate::sampler::{CancelToken, SamplingOptions, VideoSampler};

    fn person(x: f32) -> Detection {
        Detection::new(0, 0.9, BBox::new(x, 20.0, x + 10.0, 40.0))
    }

    #[test]
    fn banner_reflects_status() {
        let classes = ClassMap::default();
        let mut safe = RgbImage::new(64, 48);
        draw_overlay(&mut safe, &[], &classes, &FrameTally::default(), SafetyStatus::Safe);
        assert_eq!(safe.get_pixel(63, 0).0, SAFE_COLOR);

        let mut unsafe_img = RgbImage::new(64, 48);
        draw_overlay(
            &mut unsafe_img,
            &[],
            &classes,
            &FrameTally::default(),
            SafetyStatus::Unsafe,
        );
        assert_eq!(unsafe_img.get_pixel(63, 0).0, UNSAFE_COLOR);
    }

    #[test]
    fn boxes_and_pips_use_class_colours() {
        let classes = ClassMap::default();
        let mut image = RgbImage::new(64, 48);
        let tally = FrameTally {
            persons: 2,
            cars: 0,
            fires: 1,
        };
        draw_overlay(
            &mut image,
            &[person(5.0)],
            &classes,
            &tally,
            SafetyStatus::Safe,
        );
        // Box outline corner.
        assert_eq!(image.get_pixel(5, 20).0, PERSON_COLOR);
        // First person pip and first fire pip.
        assert_eq!(image.get_pixel(PIP_GAP, PIP_GAP).0, PERSON_COLOR);
        let fire_row = PIP_GAP + 2 * (PIP_SIZE + PIP_GAP);
        assert_eq!(image.get_pixel(PIP_GAP, fire_row).0, FIRE_COLOR);
        // No second fire pip.
        assert_eq!(
            image.get_pixel(PIP_GAP + PIP_SIZE + PIP_GAP, fire_row).0,
            SAFE_COLOR
        );
    }

    #[test]
    fn renderer_writes_every_decoded_frame() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");
        let writer = open_writer(&out).unwrap();
        let mut renderer = OverlayRenderer::new(writer, ClassMap::default(), 30);

        let cancel = CancelToken::new();
        let mut source = SyntheticSource::new(SyntheticConfig {
            frames: 7,
            width: 64,
            height: 48,
            ..SyntheticConfig::default()
        })
        .unwrap();
        let mut backend = StubBackend::fixed(vec![person(2.0)]);
        let options = SamplingOptions {
            stride: 3,
            ..SamplingOptions::default()
        };
        let summary = VideoSampler::new(options, &cancel)
            .run(&mut source, &mut backend, &mut renderer)
            .unwrap();
        assert_eq!(summary.frames_sampled, 2);

        let written = renderer.finish().unwrap();
        assert_eq!(written, out);
        let count = std::fs::read_dir(&out).unwrap().count();
        assert_eq!(count, 7);
        assert!(out.join("frame_000007.png").is_file());
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn video_output_needs_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_writer(&dir.path().join("out.mp4")).is_err());
    }
}
