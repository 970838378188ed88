use dcz_core::functions::{mean_squared_error, relu, sin, softmax_cross_entropy};
use dcz_core::{GraphEpoch, Result, Tensor, Variable};
use dcz_nn::{BatchNorm2d, Conv2d, Layer, MomentumSGD, Optimizer, Parameter, MLP, SGD};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// y = sin(2 pi x) + noise on 100 points in [0, 1).
fn sine_data() -> (Variable, Variable) {
    let x = Tensor::rand_seeded((100, 1), 0);
    let noise = Tensor::rand_seeded((100, 1), 1);
    let y = x
        .mul_scalar(2.0 * std::f32::consts::PI)
        .unwrap()
        .sin()
        .add(&noise)
        .unwrap();
    (Variable::constant(x), Variable::constant(y))
}

fn train<O: Optimizer>(model: &dyn Layer, opt: &mut O, iters: usize) -> Result<(f32, f32)> {
    let (x, y) = sine_data();
    let mut first = None;
    let mut last = 0.0;
    for _ in 0..iters {
        let _epoch = GraphEpoch::new();
        let loss = mean_squared_error(&model.forward(&x)?, &y)?;
        model.cleargrads();
        loss.backward(false, false)?;
        opt.step(model)?;
        last = loss.item()?;
        if first.is_none() {
            first = Some(last);
        }
    }
    Ok((first.unwrap_or(last), last))
}

#[test]
fn mlp_with_sgd_reduces_loss() -> Result<()> {
    init_logger();
    let model = MLP::new(&[10, 1]);
    let (first, last) = train(&model, &mut SGD::new(0.2), 1000)?;
    assert!(last < first * 0.7, "loss {first} -> {last}");
    Ok(())
}

#[test]
fn mlp_with_momentum_reduces_loss() -> Result<()> {
    let model = MLP::new(&[10, 1]);
    let (first, last) = train(&model, &mut MomentumSGD::new(0.02, 0.9), 1000)?;
    assert!(last < first * 0.7, "loss {first} -> {last}");
    Ok(())
}

#[test]
fn epochs_keep_the_tape_bounded() -> Result<()> {
    let model = MLP::new(&[4, 1]);
    let before = dcz_core::tape::len();
    train(&model, &mut SGD::new(0.1), 5)?;
    assert_eq!(dcz_core::tape::len(), before);
    Ok(())
}

// A small conv net as a user-defined composite layer.
struct TinyNet {
    conv: Conv2d,
    bn: BatchNorm2d,
    head: MLP,
}

impl TinyNet {
    fn new() -> Self {
        TinyNet {
            conv: Conv2d::new(Some(1), 2, (3, 3), (1, 1), (1, 1), true),
            bn: BatchNorm2d::new(2),
            head: MLP::with_activation(&[3], relu),
        }
    }
}

impl Layer for TinyNet {
    fn forward(&self, x: &Variable) -> Result<Variable> {
        let h = relu(&self.bn.forward(&self.conv.forward(x)?)?)?;
        let n = h.dims()[0];
        self.head
            .forward(&dcz_core::functions::reshape(&h, (n, h.elem_count() / n))?)
    }

    fn params(&self) -> Vec<(String, Parameter)> {
        let mut p = dcz_nn::prefixed("conv", self.conv.params());
        p.extend(dcz_nn::prefixed("bn", self.bn.params()));
        p.extend(dcz_nn::prefixed("head", self.head.params()));
        p
    }

    fn set_training(&self, training: bool) {
        self.bn.set_training(training);
    }
}

#[test]
fn conv_net_trains_on_classification() -> Result<()> {
    let net = TinyNet::new();
    let x = Variable::constant(Tensor::randn_seeded((6, 1, 4, 4), 3));
    let t = Tensor::from_data(vec![0i64, 1, 2, 0, 1, 2], 6)?;
    let mut opt = SGD::new(0.1);

    let mut losses = Vec::new();
    for _ in 0..40 {
        let _epoch = GraphEpoch::new();
        let loss = softmax_cross_entropy(&net.forward(&x)?, &t)?;
        net.cleargrads();
        loss.backward(false, false)?;
        opt.step(&net)?;
        losses.push(loss.item()?);
    }
    assert!(losses[39] < losses[0], "{losses:?}");

    // evaluation mode leaves the running statistics alone
    net.eval();
    let rm = net.get_param("bn.running_mean")?.to_vec();
    let y = net.forward(&x)?;
    assert_eq!(y.dims(), vec![6, 3]);
    assert_eq!(net.get_param("bn.running_mean")?.to_vec(), rm);
    assert!(net.get_param("bn.running_var")?.grad().is_none());
    Ok(())
}

#[test]
fn gradients_flow_through_a_user_function() -> Result<()> {
    let model = MLP::new(&[1]);
    let x = Variable::constant(Tensor::ones((1, 1)));
    sin(&model.forward(&x)?)?.backward(false, false)?;
    assert!(model.get_param("l0.W")?.grad().is_some());
    assert!(model.get_param("l0.b")?.grad().is_some());
    Ok(())
}
