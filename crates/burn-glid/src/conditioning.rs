//! Conditioning assembly for the guided batch

use burn::prelude::*;
use tracing::{debug, info};

use crate::error::{CollaboratorError, GlidError};
use crate::fusion::fuse;
use crate::models::{ClipTextEncoder, Conditioning, TextEncoder};

/// What to build conditioning for
#[derive(Debug, Clone)]
pub struct ConditioningRequest<'a> {
    pub prompt: &'a str,
    pub negative: &'a str,
    pub batch_size: usize,
    /// Latent `(h, w)` of the image conditioning placeholder
    pub latent_size: (usize, usize),
    pub latent_channels: usize,
    /// Pass a CLIP embedding to the network
    pub use_clip_embed: bool,
}

/// Aesthetic embedding `[1, D]` and its blend weight
pub struct AestheticSteer<B: Backend> {
    pub embedding: Tensor<B, 2>,
    pub weight: f64,
}

fn check_rows(collaborator: &'static str, rows: usize, expected: usize) -> Result<(), GlidError> {
    if rows != expected {
        return Err(CollaboratorError::new(
            collaborator,
            format!("returned {rows} rows for {expected} texts"),
        )
        .into());
    }
    Ok(())
}

/// Build `[prompt rows; negative rows]` conditioning for a doubled batch
pub fn assemble<B, T, C>(
    text_encoder: &T,
    clip_encoder: &C,
    request: &ConditioningRequest<'_>,
    aesthetic: Option<AestheticSteer<B>>,
    device: &B::Device,
) -> Result<Conditioning<B>, GlidError>
where
    B: Backend,
    T: TextEncoder<B> + ?Sized,
    C: ClipTextEncoder<B> + ?Sized,
{
    let batch = request.batch_size;
    let prompts = vec![request.prompt.to_string(); batch];
    let negatives = vec![request.negative.to_string(); batch];

    info!("Encoding text with BERT");
    let text_emb = text_encoder.encode(&prompts)?;
    let text_blank = text_encoder.encode(&negatives)?;
    check_rows("text encoder", text_emb.dims()[0], batch)?;
    check_rows("text encoder", text_blank.dims()[0], batch)?;
    let context = Tensor::cat(vec![text_emb, text_blank], 0);

    let clip_embed = if request.use_clip_embed {
        info!("Encoding text with CLIP");
        let mut clip_emb = clip_encoder.encode_text(&prompts)?;
        let clip_blank = clip_encoder.encode_text(&negatives)?;
        check_rows("CLIP text encoder", clip_emb.dims()[0], batch)?;
        check_rows("CLIP text encoder", clip_blank.dims()[0], batch)?;

        if let Some(steer) = aesthetic {
            clip_emb = fuse(clip_emb, steer.embedding, steer.weight)?;
        }
        Some(Tensor::cat(vec![clip_emb, clip_blank], 0))
    } else {
        debug!("network takes no CLIP embedding, skipping CLIP encode");
        None
    };

    let (h, w) = request.latent_size;
    let image_embed = Tensor::zeros([batch * 2, request.latent_channels, h, w], device);

    Ok(Conditioning {
        context,
        clip_embed,
        image_embed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Encodes each text as a constant row of its length
    struct LenEncoder;

    impl TextEncoder<TestBackend> for LenEncoder {
        fn encode(&self, texts: &[String]) -> Result<Tensor<TestBackend, 3>, CollaboratorError> {
            let data: Vec<f32> = texts
                .iter()
                .flat_map(|t| vec![t.len() as f32; 2 * 3])
                .collect();
            Ok(Tensor::from_data(TensorData::new(data, [texts.len(), 2, 3]), &Default::default()))
        }
    }

    impl ClipTextEncoder<TestBackend> for LenEncoder {
        fn encode_text(&self, texts: &[String]) -> Result<Tensor<TestBackend, 2>, CollaboratorError> {
            let data: Vec<f32> = texts
                .iter()
                .flat_map(|t| vec![t.len() as f32 + 1.0, 0.0])
                .collect();
            Ok(Tensor::from_data(TensorData::new(data, [texts.len(), 2]), &Default::default()))
        }
    }

    fn request(batch_size: usize, use_clip_embed: bool) -> ConditioningRequest<'static> {
        ConditioningRequest {
            prompt: "apple",
            negative: "",
            batch_size,
            latent_size: (4, 6),
            latent_channels: 4,
            use_clip_embed,
        }
    }

    #[test]
    fn test_doubled_batch_for_every_size() {
        for batch in crate::config::BATCH_SIZES {
            let cond = assemble::<TestBackend, _, _>(
                &LenEncoder,
                &LenEncoder,
                &request(batch, true),
                None,
                &Default::default(),
            )
            .unwrap();
            assert_eq!(cond.batch_size(), 2 * batch);
            assert_eq!(cond.context.dims(), [2 * batch, 2, 3]);
            assert_eq!(cond.clip_embed.as_ref().map(|c| c.dims()), Some([2 * batch, 2]));
            assert_eq!(cond.image_embed.dims(), [2 * batch, 4, 4, 6]);
        }
    }

    #[test]
    fn test_conditional_rows_first() {
        let cond = assemble::<TestBackend, _, _>(
            &LenEncoder,
            &LenEncoder,
            &request(2, true),
            None,
            &Default::default(),
        )
        .unwrap();
        let ctx: Vec<f32> = cond.context.into_data().to_vec().unwrap();
        // 2 prompt rows of 5.0, then 2 negative rows of 0.0
        assert!(ctx[..12].iter().all(|&v| v == 5.0));
        assert!(ctx[12..].iter().all(|&v| v == 0.0));

        let image: Vec<f32> = cond.image_embed.into_data().to_vec().unwrap();
        assert!(image.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_aesthetic_fuses_prompt_half_only() {
        let device = Default::default();
        let steer = AestheticSteer {
            embedding: Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![0.0f32, 3.0], [1, 2]), &device),
            weight: 1.0,
        };
        let cond = assemble(&LenEncoder, &LenEncoder, &request(1, true), Some(steer), &device).unwrap();
        let clip: Vec<f32> = cond.clip_embed.unwrap().into_data().to_vec().unwrap();
        assert_eq!(clip.len(), 4);
        assert!((clip[0] - 0.0).abs() < 1e-6 && (clip[1] - 1.0).abs() < 1e-6);
        // negative row untouched: len("") + 1
        assert_eq!(&clip[2..], &[1.0, 0.0]);
    }

    #[test]
    fn test_no_clip_embed() {
        let cond = assemble::<TestBackend, _, _>(
            &LenEncoder,
            &LenEncoder,
            &request(3, false),
            None,
            &Default::default(),
        )
        .unwrap();
        assert!(cond.clip_embed.is_none());
    }
}
