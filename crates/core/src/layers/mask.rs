use candle_core::{DType, Device, Result, Tensor};

/// Additive causal attention mask for decoder-only models.
/// Returns shape [1, 1, seq_len, seq_len + seqlen_offset]; positions already
/// in the cache (before the offset) are fully visible.
pub fn causal_mask(
    seq_len: usize,
    seqlen_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + seqlen_offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, total_len), device)?;
    mask.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_prefill() {
        let mask = causal_mask(3, 0, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows = mask.squeeze(0).unwrap().squeeze(0).unwrap();
        let rows = rows.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite() && rows[0][1] < 0.0);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_causal_mask_with_offset_sees_past() {
        let mask = causal_mask(2, 4, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 2, 6]);
        let rows = mask.squeeze(0).unwrap().squeeze(0).unwrap();
        let rows = rows.to_vec2::<f32>().unwrap();
        // First new token sees the 4 cached positions plus itself.
        assert_eq!(&rows[0][..5], &[0.0; 5]);
        assert!(rows[0][5].is_infinite());
        assert_eq!(rows[1], vec![0.0; 6]);
    }
}
