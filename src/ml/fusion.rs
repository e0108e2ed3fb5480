// ============================================================
// Layer 5 — Fusion Encoder
// ============================================================
// One timepoint in, one joint embedding out:
//
//   [audio(A) ‖ handwriting(S) ‖ scalars_z(k)]        (A+S+k)
//        │ Linear → n_tokens × D, LayerNorm, ReLU, Dropout
//        ▼
//   modality tokens                                   [T, D]
//        │ EncoderBlock × num_layers (self-attention + FFN)
//        ▼
//   mean over tokens                                  [D]
//        │ Linear → ReLU → Dropout → Linear
//        ▼
//   joint embedding                                   [D]
//
// The projection splits the concatenated input into a few
// learned tokens so attention has something to attend across.
// Stateless apart from the weights.

use burn::{
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::{gelu, relu},
};

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct FusionEncoderConfig {
    /// A + S + k
    pub input_dim: usize,
    #[config(default = 128)]
    pub d_model:   usize,
    #[config(default = 3)]
    pub n_tokens:  usize,
    #[config(default = 2)]
    pub num_heads: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 128)]
    pub d_ff:      usize,
    #[config(default = 0.1)]
    pub dropout:   f64,
}

impl FusionEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FusionEncoder<B> {
        let input_proj = LinearConfig::new(self.input_dim, self.n_tokens * self.d_model).init(device);
        let input_norm = LayerNormConfig::new(self.d_model).init(device);
        let blocks: Vec<FusionBlock<B>> = (0..self.num_layers)
            .map(|_| self.build_block(device))
            .collect();
        let out_proj1 = LinearConfig::new(self.d_model, self.d_model).init(device);
        let out_proj2 = LinearConfig::new(self.d_model, self.d_model).init(device);
        let dropout   = DropoutConfig::new(self.dropout).init();
        FusionEncoder {
            input_proj, input_norm, blocks,
            out_proj1, out_proj2, dropout,
            input_dim: self.input_dim,
            n_tokens:  self.n_tokens,
            d_model:   self.d_model,
        }
    }

    fn build_block<B: Backend>(&self, device: &B::Device) -> FusionBlock<B> {
        let self_attn   = MultiHeadAttentionConfig::new(self.d_model, self.num_heads)
            .with_dropout(self.dropout)
            .init(device);
        let ffn_linear1 = LinearConfig::new(self.d_model, self.d_ff).init(device);
        let ffn_linear2 = LinearConfig::new(self.d_ff, self.d_model).init(device);
        let norm1   = LayerNormConfig::new(self.d_model).init(device);
        let norm2   = LayerNormConfig::new(self.d_model).init(device);
        let dropout = DropoutConfig::new(self.dropout).init();
        FusionBlock { self_attn, ffn_linear1, ffn_linear2, norm1, norm2, dropout }
    }
}

/// Post-norm transformer block over the modality tokens.
#[derive(Module, Debug)]
pub struct FusionBlock<B: Backend> {
    pub self_attn:   MultiHeadAttention<B>,
    pub ffn_linear1: Linear<B>,
    pub ffn_linear2: Linear<B>,
    pub norm1:       LayerNorm<B>,
    pub norm2:       LayerNorm<B>,
    pub dropout:     Dropout,
}

impl<B: Backend> FusionBlock<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let attn_output = self.self_attn.forward(MhaInput::self_attn(x.clone())).context;
        let x = self.norm1.forward(x + self.dropout.forward(attn_output));
        let ffn_out = self.ffn_linear2.forward(gelu(self.ffn_linear1.forward(x.clone())));
        self.norm2.forward(x + self.dropout.forward(ffn_out))
    }
}

#[derive(Module, Debug)]
pub struct FusionEncoder<B: Backend> {
    pub input_proj: Linear<B>,
    pub input_norm: LayerNorm<B>,
    pub blocks:     Vec<FusionBlock<B>>,
    pub out_proj1:  Linear<B>,
    pub out_proj2:  Linear<B>,
    pub dropout:    Dropout,
    pub input_dim:  usize,
    pub n_tokens:   usize,
    pub d_model:    usize,
}

impl<B: Backend> FusionEncoder<B> {
    /// x: [n, A+S+k] → [n, D]
    pub fn forward_points(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n, _] = x.dims();

        let tokens = self
            .input_proj
            .forward(x)
            .reshape([n, self.n_tokens, self.d_model]);
        let mut tokens = self.dropout.forward(relu(self.input_norm.forward(tokens)));
        for block in &self.blocks {
            tokens = block.forward(tokens);
        }

        let pooled = tokens.mean_dim(1).reshape([n, self.d_model]);
        let hidden = self.dropout.forward(relu(self.out_proj1.forward(pooled)));
        self.out_proj2.forward(hidden)
    }

    /// x: [batch, seq_len, A+S+k] → [batch, seq_len, D]
    ///
    /// Timepoints are encoded independently; the sequence axis is only
    /// folded into the batch axis and restored afterwards.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, width] = x.dims();
        self.forward_points(x.reshape([batch * seq_len, width]))
            .reshape([batch, seq_len, self.d_model])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{default_device, tensor_to_vec, InnerBackend};

    // audio 128, handwriting 128, age/baseline/typing/gait
    const INPUT_DIM: usize = 128 + 128 + 4;

    #[test]
    fn stays_within_parameter_budget() {
        let encoder: FusionEncoder<InnerBackend> =
            FusionEncoderConfig::new(INPUT_DIM).init(&default_device());
        let n = encoder.num_params();
        assert!(n < 350_000, "fusion encoder has {n} parameters");
    }

    #[test]
    fn emits_d_model_at_every_position() {
        let device = default_device();
        let encoder: FusionEncoder<InnerBackend> =
            FusionEncoderConfig::new(10).with_d_model(16).init(&device);
        let x = Tensor::<InnerBackend, 3>::random([2, 4, 10], burn::tensor::Distribution::Default, &device);
        assert_eq!(encoder.forward(x).dims(), [2, 4, 16]);
    }

    #[test]
    fn timepoints_are_encoded_independently() {
        let device = default_device();
        let encoder: FusionEncoder<InnerBackend> =
            FusionEncoderConfig::new(6).with_d_model(8).init(&device);
        let x = Tensor::<InnerBackend, 3>::random([1, 3, 6], burn::tensor::Distribution::Default, &device);

        let whole = tensor_to_vec(encoder.forward(x.clone())).unwrap();
        let last = tensor_to_vec(encoder.forward(x.slice([0..1, 2..3, 0..6]))).unwrap();
        for (a, b) in whole[16..].iter().zip(&last) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
