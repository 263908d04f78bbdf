use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

/// SwiGLU MLP over a fused `gate_up_proj`.
///
/// The checkpoint re-layout merges `gate_proj` and `up_proj` row-wise into a
/// single `(2·intermediate, hidden)` weight, so one matmul produces both
/// halves.
#[derive(Debug)]
pub struct SwiGluMlp {
    gate_up_proj: Linear,
    down_proj: Linear,
    intermediate_size: usize,
}

impl SwiGluMlp {
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let gate_up_proj =
            linear_no_bias(hidden_size, 2 * intermediate_size, vb.pp("gate_up_proj"))?;
        let down_proj = linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?;
        Ok(Self {
            gate_up_proj,
            down_proj,
            intermediate_size,
        })
    }
}

impl Module for SwiGluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.forward(xs)?;
        let last = gate_up.rank() - 1;
        let gate = gate_up.narrow(last, 0, self.intermediate_size)?;
        let up = gate_up.narrow(last, self.intermediate_size, self.intermediate_size)?;
        (candle_nn::ops::silu(&gate)? * up)?.apply(&self.down_proj)
    }
}
