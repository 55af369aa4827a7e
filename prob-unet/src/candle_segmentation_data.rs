use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

pub struct SegmentationMinibatch {
    /// `(b, input_channels, h, w)`
    pub image: Tensor,
    /// `(b, num_classes, h, w)`
    pub label: Tensor,
}

/// `SegmentationDataLoader` for minibatch learning
pub trait SegmentationDataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<SegmentationMinibatch>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    /// Shuffle samples and cut them into chunks of `batch_size`; the
    /// last chunk may be smaller
    pub fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) {
        self.samples.shuffle(rng);
        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Image/label pairs kept in memory, one `(1, c, h, w)` tensor per
/// sample. Minibatches are concatenated along the batch axis.
///
pub struct InMemorySegmentationData {
    images: Vec<Tensor>,
    labels: Vec<Tensor>,
    minibatches: Minibatches,
    shuffle_rng: StdRng,
}

impl InMemorySegmentationData {
    pub fn new(images: Vec<Tensor>, labels: Vec<Tensor>) -> anyhow::Result<Self> {
        if images.len() != labels.len() {
            return Err(anyhow::anyhow!(
                "{} images vs. {} labels",
                images.len(),
                labels.len()
            ));
        }
        for (x, y) in images.iter().zip(labels.iter()) {
            let (xb, _, xh, xw) = x.dims4()?;
            let (yb, _, yh, yw) = y.dims4()?;
            if xb != 1 || yb != 1 || (xh, xw) != (yh, yw) {
                return Err(anyhow::anyhow!(
                    "expected aligned (1, c, h, w) pairs, got {:?} and {:?}",
                    x.dims(),
                    y.dims()
                ));
            }
        }

        let samples = (0..images.len()).collect();
        Ok(Self {
            images,
            labels,
            minibatches: Minibatches {
                samples,
                chunks: vec![],
            },
            shuffle_rng: StdRng::from_rng(&mut rand::rng()),
        })
    }

    /// Fix the minibatch order produced by `shuffle_minibatch`
    pub fn set_shuffle_seed(&mut self, seed: u64) {
        self.shuffle_rng = StdRng::seed_from_u64(seed);
    }

    pub fn num_samples(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, i: usize) -> Option<&Tensor> {
        self.images.get(i)
    }

    pub fn label(&self, i: usize) -> Option<&Tensor> {
        self.labels.get(i)
    }

    /// The first `n` samples stacked into one batch, handy for evaluation
    pub fn head(&self, n: usize, target_device: &Device) -> anyhow::Result<SegmentationMinibatch> {
        let n = n.min(self.num_samples());
        if n == 0 {
            return Err(anyhow::anyhow!("empty data"));
        }
        let samples = (0..n).collect::<Vec<_>>();
        self.take(&samples, target_device)
    }

    fn take(
        &self,
        samples: &[usize],
        target_device: &Device,
    ) -> anyhow::Result<SegmentationMinibatch> {
        let images = samples.iter().map(|&i| &self.images[i]).collect::<Vec<_>>();
        let labels = samples.iter().map(|&i| &self.labels[i]).collect::<Vec<_>>();
        Ok(SegmentationMinibatch {
            image: Tensor::cat(&images, 0)?.to_device(target_device)?,
            label: Tensor::cat(&labels, 0)?.to_device(target_device)?,
        })
    }
}

impl SegmentationDataLoader for InMemorySegmentationData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<SegmentationMinibatch> {
        let chunk = self.minibatches.chunks.get(batch_idx).ok_or_else(|| {
            anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.minibatches.chunks.len()
            )
        })?;
        self.take(chunk, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }
        self.minibatches.shuffle_minibatch(batch_size, &mut self.shuffle_rng);
        Ok(())
    }
}

/// label radius relative to the visible disk
const RADIUS_FACTORS: [f32; 3] = [0.7, 1.0, 1.3];
const IMAGE_NOISE_SD: f32 = 0.3;

///
/// Noisy disks whose segmentation is ambiguous: every label is drawn
/// from a few plausible radii around the visible one, so one image
/// admits several correct masks.
///
/// * `num_samples` - number of image/label pairs
/// * `size` - image height and width
/// * `rng` - source of all randomness, including the minibatch order
///
/// # Returns images `(1, 1, size, size)` and two-class one-hot labels
/// `(1, 2, size, size)` with background first
///
pub fn synthetic_ambiguous_disks<R: Rng>(
    num_samples: usize,
    size: usize,
    rng: &mut R,
) -> anyhow::Result<InMemorySegmentationData> {
    if size < 4 {
        return Err(anyhow::anyhow!("image size {} is too small", size));
    }

    let half = size as f32 / 2.;
    let params = (0..num_samples)
        .map(|_| {
            let cy = half + rng.random_range(-0.1..0.1) * size as f32;
            let cx = half + rng.random_range(-0.1..0.1) * size as f32;
            let radius = rng.random_range(0.15..0.25) * size as f32;
            let factor = *RADIUS_FACTORS.choose(rng).unwrap_or(&1.0);
            let seed = rng.random::<u64>();
            (cy, cx, radius, radius * factor, seed)
        })
        .collect::<Vec<_>>();

    let noise = Normal::new(0f32, IMAGE_NOISE_SD)?;

    let pixels = params
        .par_iter()
        .map(|&(cy, cx, radius, label_radius, seed)| {
            let mut local_rng = StdRng::seed_from_u64(seed);
            let mut image = vec![0f32; size * size];
            let mut fg = vec![0f32; size * size];
            for i in 0..size {
                for j in 0..size {
                    let dy = i as f32 + 0.5 - cy;
                    let dx = j as f32 + 0.5 - cx;
                    let d = (dy * dy + dx * dx).sqrt();
                    let inside = if d <= radius { 1. } else { 0. };
                    image[i * size + j] = inside + noise.sample(&mut local_rng);
                    fg[i * size + j] = if d <= label_radius { 1. } else { 0. };
                }
            }
            (image, fg)
        })
        .collect::<Vec<_>>();

    let shuffle_seed = rng.random::<u64>();

    let mut images = Vec::with_capacity(num_samples);
    let mut labels = Vec::with_capacity(num_samples);
    for (image, fg) in pixels {
        let bg = fg.iter().map(|v| 1. - v).collect::<Vec<f32>>();
        images.push(Tensor::from_vec(image, (1, 1, size, size), &Device::Cpu)?);
        let fg = Tensor::from_vec(fg, (1, 1, size, size), &Device::Cpu)?;
        let bg = Tensor::from_vec(bg, (1, 1, size, size), &Device::Cpu)?;
        labels.push(Tensor::cat(&[&bg, &fg], 1)?);
    }

    let mut data = InMemorySegmentationData::new(images, labels)?;
    data.set_shuffle_seed(shuffle_seed);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minibatches_cover_all_samples() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut data = synthetic_ambiguous_disks(10, 16, &mut rng)?;
        data.shuffle_minibatch(4)?;
        assert_eq!(data.num_minibatch(), 3);

        let mut total = 0;
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, &Device::Cpu)?;
            let (nb, c, h, w) = mb.image.dims4()?;
            assert_eq!((c, h, w), (1, 16, 16));
            assert_eq!(mb.label.dims4()?, (nb, 2, 16, 16));
            total += nb;
        }
        assert_eq!(total, 10);
        assert!(data.minibatch_data(3, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_labels_are_one_hot() -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let data = synthetic_ambiguous_disks(3, 16, &mut rng)?;
        let mb = data.head(3, &Device::Cpu)?;
        let class_sum = mb.label.sum(1)?;
        let ones = class_sum.ones_like()?;
        let max_diff = (class_sum - ones)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(max_diff, 0.0);

        let fg = mb.label.narrow(1, 1, 1)?.sum_all()?.to_scalar::<f32>()?;
        assert!(fg > 0.0);
        Ok(())
    }

    #[test]
    fn test_same_seed_same_data() -> anyhow::Result<()> {
        let a = synthetic_ambiguous_disks(2, 8, &mut StdRng::seed_from_u64(7))?;
        let b = synthetic_ambiguous_disks(2, 8, &mut StdRng::seed_from_u64(7))?;
        for i in 0..2 {
            let (xa, xb) = (a.image(i).unwrap(), b.image(i).unwrap());
            let diff = (xa - xb)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert_eq!(diff, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_same_seed_same_minibatch_order() -> anyhow::Result<()> {
        let mut a = synthetic_ambiguous_disks(12, 8, &mut StdRng::seed_from_u64(11))?;
        let mut b = synthetic_ambiguous_disks(12, 8, &mut StdRng::seed_from_u64(11))?;
        for _ in 0..2 {
            a.shuffle_minibatch(5)?;
            b.shuffle_minibatch(5)?;
            assert_eq!(a.num_minibatch(), b.num_minibatch());
            for k in 0..a.num_minibatch() {
                let xa = a.minibatch_data(k, &Device::Cpu)?.image;
                let xb = b.minibatch_data(k, &Device::Cpu)?.image;
                let diff = (xa - xb)?.abs()?.max_all()?.to_scalar::<f32>()?;
                assert_eq!(diff, 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_minibatches_follow_rng() {
        let mut a = Minibatches {
            samples: (0..20).collect(),
            chunks: vec![],
        };
        let mut b = Minibatches {
            samples: (0..20).collect(),
            chunks: vec![],
        };
        a.shuffle_minibatch(6, &mut StdRng::seed_from_u64(5));
        b.shuffle_minibatch(6, &mut StdRng::seed_from_u64(5));
        assert_eq!(a.chunks, b.chunks);
        assert_eq!(a.chunks.len(), 4);
        assert_eq!(a.chunks.iter().map(|c| c.len()).sum::<usize>(), 20);
    }

    #[test]
    fn test_rejects_misaligned_pairs() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros((1, 1, 8, 8), candle_core::DType::F32, &dev)?;
        let y = Tensor::zeros((1, 2, 4, 4), candle_core::DType::F32, &dev)?;
        assert!(InMemorySegmentationData::new(vec![x.clone()], vec![y]).is_err());
        assert!(InMemorySegmentationData::new(vec![x], vec![]).is_err());
        Ok(())
    }
}
