// ============================================================
// Layer 5 — Forecast Head
// ============================================================
// Consumes one joint embedding per historical timepoint plus
// that timepoint's step features:
//
//   step input = [joint(D) ‖ time_z ‖ score_z | 0 ‖ observed]
//
// and runs them through stacked GRU layers. The hidden state
// after the last timepoint goes through a small feed-forward
// head with one output per configured horizon. Outputs are in
// standardized score units; the caller denormalizes.

use burn::{
    nn::{
        gru::{Gru, GruConfig},
        Dropout, DropoutConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::data::preprocessor::STEP_FEATURES;

#[derive(Config, Debug)]
pub struct ForecastHeadConfig {
    /// Width of the joint embedding coming from the Fusion Encoder
    pub joint_dim:  usize,
    pub n_horizons: usize,
    #[config(default = 64)]
    pub hidden:     usize,
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 0.1)]
    pub dropout:    f64,
}

impl ForecastHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ForecastHead<B> {
        let layers: Vec<Gru<B>> = (0..self.num_layers.max(1))
            .map(|i| {
                let d_in = if i == 0 { self.joint_dim + STEP_FEATURES } else { self.hidden };
                GruConfig::new(d_in, self.hidden, true).init(device)
            })
            .collect();
        ForecastHead {
            layers,
            head1:      LinearConfig::new(self.hidden, self.hidden).init(device),
            head2:      LinearConfig::new(self.hidden, self.n_horizons).init(device),
            dropout:    DropoutConfig::new(self.dropout).init(),
            hidden:     self.hidden,
            n_horizons: self.n_horizons,
        }
    }
}

#[derive(Module, Debug)]
pub struct ForecastHead<B: Backend> {
    pub layers:     Vec<Gru<B>>,
    pub head1:      Linear<B>,
    pub head2:      Linear<B>,
    pub dropout:    Dropout,
    pub hidden:     usize,
    pub n_horizons: usize,
}

impl<B: Backend> ForecastHead<B> {
    /// joint: [batch, seq_len, D], steps: [batch, seq_len, 3] → [batch, H]
    pub fn forward(&self, joint: Tensor<B, 3>, steps: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, seq_len, _] = joint.dims();

        let mut x = Tensor::cat(vec![joint, steps], 2);
        let last_layer = self.layers.len() - 1;
        for (i, gru) in self.layers.iter().enumerate() {
            x = gru.forward(x, None);
            if i < last_layer {
                x = self.dropout.forward(x);
            }
        }

        let final_state = x
            .slice([0..batch, seq_len - 1..seq_len, 0..self.hidden])
            .reshape([batch, self.hidden]);
        let h = self.dropout.forward(relu(self.head1.forward(final_state)));
        self.head2.forward(h)
    }
}
